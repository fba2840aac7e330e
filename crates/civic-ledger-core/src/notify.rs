use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Notification intents emitted after a successful commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    TokensIssued {
        government_id: String,
        recipient_id: String,
        amount: u64,
        entry_id: String,
    },
    ProjectSupported {
        citizen_id: String,
        project_id: String,
        tokens: u64,
        entry_id: String,
    },
    ProjectFullyFunded {
        project_id: String,
        owner_id: String,
    },
    ProjectReviewed {
        project_id: String,
        owner_id: String,
        status: String,
    },
    ConversionRequested {
        conversion_id: String,
        owner_id: String,
        token_amount: u64,
    },
    ConversionStatusChanged {
        conversion_id: String,
        owner_id: String,
        status: String,
    },
    RequestReviewed {
        kind: String,
        request_id: String,
        requester_id: String,
        status: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationIntent {
    pub recipient_id: String,
    pub event: NotificationEvent,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotificationError(pub String);

/// Fire-and-forget delivery channel (email, push, webhooks).
///
/// Failures are logged by the caller and never undo a committed mutation.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, intent: &NotificationIntent) -> Result<(), NotificationError>;
}

/// Sink that drops every intent.
#[derive(Debug, Clone, Default)]
pub struct NoopNotificationSink;

#[async_trait]
impl NotificationSink for NoopNotificationSink {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn deliver(&self, _intent: &NotificationIntent) -> Result<(), NotificationError> {
        Ok(())
    }
}
