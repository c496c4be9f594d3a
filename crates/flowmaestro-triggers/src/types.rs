//! Trigger kinds and their configurations

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The four ways an execution gets launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Schedule,
    Webhook,
    Event,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Webhook => "webhook",
            Self::Event => "event",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(Self::Schedule),
            "webhook" => Ok(Self::Webhook),
            "event" => Ok(Self::Event),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Standard five-field cron expression.
    pub cron: String,

    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Response body shape a webhook trigger answers with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookResponseFormat {
    /// `{"success":true,"executionId":…}`
    #[default]
    Json,

    /// Plain `ok`
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Accepted HTTP methods, uppercase. Empty means POST only.
    #[serde(default)]
    pub allowed_methods: Vec<String>,

    /// Header carrying the HMAC signature.
    #[serde(default = "default_signature_header")]
    pub signature_header: String,

    /// Signature verification can be disabled per trigger, explicitly.
    #[serde(default = "default_true")]
    pub verify_signature: bool,

    #[serde(default)]
    pub response_format: WebhookResponseFormat,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            allowed_methods: vec![],
            signature_header: default_signature_header(),
            verify_signature: true,
            response_format: WebhookResponseFormat::Json,
        }
    }
}

impl WebhookConfig {
    pub fn method_allowed(&self, method: &str) -> bool {
        if self.allowed_methods.is_empty() {
            return method.eq_ignore_ascii_case("POST");
        }
        self.allowed_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }
}

fn default_signature_header() -> String {
    "X-Signature".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub topic: String,

    /// Exact-match filters against top-level payload fields.
    #[serde(default)]
    pub filters: Map<String, Value>,
}

impl EventConfig {
    pub fn matches(&self, payload: &Value) -> bool {
        self.filters
            .iter()
            .all(|(key, expected)| payload.get(key) == Some(expected))
    }
}

/// A schedule trigger's persisted runtime state, surfaced to the API.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleState {
    pub handle: Option<String>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            TriggerKind::Schedule,
            TriggerKind::Webhook,
            TriggerKind::Event,
            TriggerKind::Manual,
        ] {
            assert_eq!(kind.as_str().parse::<TriggerKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_webhook_defaults() {
        let config: WebhookConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.signature_header, "X-Signature");
        assert!(config.verify_signature);
        assert!(config.method_allowed("POST"));
        assert!(config.method_allowed("post"));
        assert!(!config.method_allowed("GET"));
    }

    #[test]
    fn test_webhook_method_allow_list() {
        let config: WebhookConfig =
            serde_json::from_value(json!({"allowed_methods": ["PUT", "POST"]})).unwrap();
        assert!(config.method_allowed("put"));
        assert!(!config.method_allowed("DELETE"));
    }

    #[test]
    fn test_event_filters() {
        let config: EventConfig = serde_json::from_value(json!({
            "topic": "orders",
            "filters": {"status": "paid", "region": "eu"}
        }))
        .unwrap();

        assert!(config.matches(&json!({"status": "paid", "region": "eu", "extra": 1})));
        assert!(!config.matches(&json!({"status": "pending", "region": "eu"})));
        assert!(!config.matches(&json!({"region": "eu"})));
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let config: EventConfig =
            serde_json::from_value(json!({"topic": "orders"})).unwrap();
        assert!(config.matches(&json!({"anything": true})));
    }
}
