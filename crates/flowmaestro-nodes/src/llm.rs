//! LLM invocation node
//!
//! Calls a configured model provider over plain HTTP. Credentials come from
//! the resolver by id, with the provider's conventional environment variable
//! as a fallback for local development.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use flowmaestro_core::{ErrorKind, NodeContext, NodeError, NodeExecutor, NodeMetadata};

use crate::resolver::CredentialResolver;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct LlmExecutor {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialResolver>,
}

impl LlmExecutor {
    pub fn new(client: reqwest::Client, credentials: Arc<dyn CredentialResolver>) -> Self {
        Self {
            client,
            credentials,
        }
    }

    async fn api_key(&self, config: &Value, provider: &str) -> Result<String, NodeError> {
        if let Some(credential_id) = config.get("credentialId").and_then(Value::as_str) {
            let credential = self.credentials.resolve(credential_id).await?;
            return credential
                .get("api_key")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    NodeError::permanent(
                        ErrorKind::Auth,
                        format!("credential {credential_id:?} has no api_key"),
                    )
                });
        }

        let env_var = match provider {
            "anthropic" => "ANTHROPIC_API_KEY",
            _ => "OPENAI_API_KEY",
        };
        std::env::var(env_var).map_err(|_| {
            NodeError::permanent(
                ErrorKind::Auth,
                format!("no credentialId configured and {env_var} is not set"),
            )
        })
    }
}

#[async_trait]
impl NodeExecutor for LlmExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("ai", true)
            .with_timeout(Duration::from_secs(120))
            .with_config_schema(json!({
                "type": "object",
                "required": ["model", "prompt"],
                "properties": {
                    "provider": { "enum": ["openai", "anthropic"], "default": "openai" },
                    "model": { "type": "string" },
                    "prompt": { "type": "string" },
                    "systemPrompt": { "type": "string" },
                    "temperature": { "type": "number" },
                    "maxTokens": { "type": "integer" },
                    "credentialId": { "type": "string" }
                }
            }))
    }

    async fn execute(
        &self,
        config: Value,
        _inputs: Value,
        _ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        let provider = config
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or("openai");
        let model = config
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::validation("llm config requires \"model\""))?;
        let prompt = config
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::validation("llm config requires \"prompt\""))?;

        let api_key = self.api_key(&config, provider).await?;

        match provider {
            "openai" => self.call_openai(&config, model, prompt, &api_key).await,
            "anthropic" => self.call_anthropic(&config, model, prompt, &api_key).await,
            other => Err(NodeError::validation(format!(
                "unknown llm provider {other:?}"
            ))),
        }
    }
}

impl LlmExecutor {
    async fn call_openai(
        &self,
        config: &Value,
        model: &str,
        prompt: &str,
        api_key: &str,
    ) -> Result<Value, NodeError> {
        let mut messages = Vec::new();
        if let Some(system) = config.get("systemPrompt").and_then(Value::as_str) {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut body = json!({ "model": model, "messages": messages });
        if let Some(t) = config.get("temperature").and_then(Value::as_f64) {
            body["temperature"] = json!(t);
        }
        if let Some(m) = config.get("maxTokens").and_then(Value::as_u64) {
            body["max_tokens"] = json!(m);
        }

        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| NodeError::retryable(ErrorKind::Server, e.to_string()))?;

        if status >= 400 {
            return Err(classify_provider_status(status, &payload));
        }

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(json!({
            "provider": "openai",
            "model": model,
            "content": content,
            "usage": payload.get("usage").cloned().unwrap_or(Value::Null),
        }))
    }

    async fn call_anthropic(
        &self,
        config: &Value,
        model: &str,
        prompt: &str,
        api_key: &str,
    ) -> Result<Value, NodeError> {
        let mut body = json!({
            "model": model,
            "max_tokens": config.get("maxTokens").and_then(Value::as_u64).unwrap_or(1024),
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(system) = config.get("systemPrompt").and_then(Value::as_str) {
            body["system"] = json!(system);
        }
        if let Some(t) = config.get("temperature").and_then(Value::as_f64) {
            body["temperature"] = json!(t);
        }

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| NodeError::retryable(ErrorKind::Server, e.to_string()))?;

        if status >= 400 {
            return Err(classify_provider_status(status, &payload));
        }

        let content = payload["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(json!({
            "provider": "anthropic",
            "model": model,
            "content": content,
            "usage": payload.get("usage").cloned().unwrap_or(Value::Null),
        }))
    }
}

fn classify_transport(err: reqwest::Error) -> NodeError {
    if err.is_timeout() {
        NodeError::timeout(err.to_string())
    } else {
        NodeError::retryable(ErrorKind::Network, err.to_string())
    }
}

fn classify_provider_status(status: u16, payload: &Value) -> NodeError {
    let message = format!("provider returned {status}: {payload}");
    match status {
        401 | 403 => NodeError::permanent(ErrorKind::Auth, message),
        429 => NodeError::retryable(ErrorKind::RateLimited, message),
        400..=499 => NodeError::permanent(ErrorKind::Validation, message),
        _ => NodeError::retryable(ErrorKind::Server, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::NullCredentialResolver;
    use crate::testutil::TestCtx;

    #[tokio::test]
    async fn test_missing_model_is_validation() {
        let executor = LlmExecutor::new(reqwest::Client::new(), Arc::new(NullCredentialResolver));
        let err = executor
            .execute(json!({"prompt": "hi"}), json!({}), &TestCtx::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unknown_credential_is_not_found() {
        let executor = LlmExecutor::new(reqwest::Client::new(), Arc::new(NullCredentialResolver));
        let err = executor
            .execute(
                json!({"model": "gpt-4o", "prompt": "hi", "credentialId": "missing"}),
                json!({}),
                &TestCtx::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_provider_status_classification() {
        assert_eq!(
            classify_provider_status(401, &json!({})).kind,
            ErrorKind::Auth
        );
        assert!(classify_provider_status(429, &json!({})).retryable);
        assert!(classify_provider_status(500, &json!({})).retryable);
        assert!(!classify_provider_status(422, &json!({})).retryable);
    }
}
