//! # Trigger Supervisor
//!
//! Manages the four trigger kinds — schedule, webhook, event, manual —
//! against their persisted configuration: cron jobs that hot-reload on
//! trigger changes, HMAC-verified webhook ingress with full request
//! logging, topic watchers for event triggers, and per-user admission
//! control over every launch path.

pub mod supervisor;
pub mod types;
pub mod webhook;

pub use supervisor::{
    next_fire, normalize_cron, AdmissionConfig, ExecutionLauncher, LaunchRequest, StartOutcome,
    TriggerError, TriggerSupervisor, WebhookReply, WebhookRequest,
};
pub use types::{EventConfig, ScheduleConfig, TriggerKind, WebhookConfig, WebhookResponseFormat};
