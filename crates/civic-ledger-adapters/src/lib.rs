//! Notification sink adapters for the civic ledger.

#![deny(unsafe_code)]

use async_trait::async_trait;
use civic_ledger_core::notify::{NotificationError, NotificationIntent, NotificationSink};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Writes every intent to the structured log.
#[derive(Debug, Clone, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn deliver(&self, intent: &NotificationIntent) -> Result<(), NotificationError> {
        let event = serde_json::to_string(&intent.event)
            .map_err(|err| NotificationError(err.to_string()))?;
        info!(
            recipient = %intent.recipient_id,
            emitted_at = %intent.emitted_at,
            event = %event,
            "Notification"
        );
        Ok(())
    }
}

/// Keeps delivered intents in memory; clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotificationSink {
    delivered: Arc<Mutex<Vec<NotificationIntent>>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<NotificationIntent> {
        self.delivered
            .lock()
            .map(|delivered| delivered.clone())
            .unwrap_or_default()
    }

    pub fn delivered_to(&self, recipient_id: &str) -> Vec<NotificationIntent> {
        self.delivered()
            .into_iter()
            .filter(|intent| intent.recipient_id == recipient_id)
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, intent: &NotificationIntent) -> Result<(), NotificationError> {
        self.delivered
            .lock()
            .map_err(|_| NotificationError("recording buffer poisoned".to_string()))?
            .push(intent.clone());
        Ok(())
    }
}

/// Deterministic failing sink for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailNotificationSink {
    reason: String,
}

impl AlwaysFailNotificationSink {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for AlwaysFailNotificationSink {
    fn name(&self) -> &'static str {
        "always_fail"
    }

    async fn deliver(&self, _intent: &NotificationIntent) -> Result<(), NotificationError> {
        Err(NotificationError(self.reason.clone()))
    }
}
