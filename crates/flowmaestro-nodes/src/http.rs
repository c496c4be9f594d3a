//! Outbound HTTP request node

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};

use flowmaestro_core::{
    ErrorKind, LogLevel, NodeContext, NodeError, NodeExecutor, NodeMetadata,
};

pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeExecutor for HttpExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("network", true)
            .with_timeout(Duration::from_secs(30))
            .with_config_schema(json!({
                "type": "object",
                "required": ["url"],
                "properties": {
                    "url": { "type": "string" },
                    "method": { "type": "string", "default": "GET" },
                    "headers": { "type": "object" },
                    "query": { "type": "object" },
                    "body": {}
                }
            }))
            .with_output_schema(json!({
                "type": "object",
                "properties": {
                    "status": { "type": "integer" },
                    "headers": { "type": "object" },
                    "data": {}
                }
            }))
    }

    async fn execute(
        &self,
        config: Value,
        _inputs: Value,
        ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::validation("http config requires \"url\""))?;

        let method_raw = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let method: Method = method_raw
            .parse()
            .map_err(|_| NodeError::validation(format!("invalid HTTP method {method_raw:?}")))?;

        let mut request = self.client.request(method, url);

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        if let Some(query) = config.get("query").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| {
                    let text = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), text)
                })
                .collect();
            request = request.query(&pairs);
        }

        if let Some(body) = config.get("body") {
            if !body.is_null() {
                request = request.json(body);
            }
        }

        ctx.log(
            LogLevel::Debug,
            &format!("{method_raw} {url}"),
            None,
        );

        let response = request.send().await.map_err(classify_transport)?;

        let status = response.status();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), Value::String(value.to_string()));
            }
        }

        let text = response.text().await.map_err(classify_transport)?;
        let data: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &data));
        }

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
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

fn classify_status(status: u16, body: &Value) -> NodeError {
    let message = format!("upstream returned {status}: {body}");
    match status {
        401 | 403 => NodeError::permanent(ErrorKind::Auth, message),
        404 => NodeError::permanent(ErrorKind::NotFound, message),
        429 => NodeError::retryable(ErrorKind::RateLimited, message),
        400..=499 => NodeError::permanent(ErrorKind::Validation, message),
        _ => NodeError::retryable(ErrorKind::Server, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(401, &json!({})).kind, ErrorKind::Auth);
        assert_eq!(classify_status(404, &json!({})).kind, ErrorKind::NotFound);

        let rate_limited = classify_status(429, &json!({}));
        assert_eq!(rate_limited.kind, ErrorKind::RateLimited);
        assert!(rate_limited.retryable);

        let bad_request = classify_status(422, &json!({}));
        assert_eq!(bad_request.kind, ErrorKind::Validation);
        assert!(!bad_request.retryable);

        let server = classify_status(503, &json!({}));
        assert_eq!(server.kind, ErrorKind::Server);
        assert!(server.retryable);
    }

    #[test]
    fn test_metadata_is_retryable() {
        let executor = HttpExecutor::new(reqwest::Client::new());
        let meta = executor.metadata();
        assert!(meta.retryable);
        assert_eq!(meta.default_timeout, Duration::from_secs(30));
    }
}
