use crate::prelude::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Only fields that differ from the last published value.
    #[default]
    Changed,
    /// Every present field, every cycle.
    All,
}

impl std::fmt::Display for PublishMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PublishMode::Changed => write!(f, "changed"),
            PublishMode::All => write!(f, "all"),
        }
    }
}

/// Destination for decoded field values.
///
/// Implementations own their batching and retry state, must not block the
/// caller on a slow destination, and are called concurrently by every
/// device-class poller.
#[async_trait]
pub trait PublishSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(
        &self,
        device: &DeviceId,
        field: &str,
        value: &FieldValue,
        timestamp: DateTime<Utc>,
        is_change: bool,
    ) -> Result<()>;

    /// Called once all fields of one device poll were published.
    async fn end_cycle(&self, _device: &DeviceId, _timestamp: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

/// A sink with the publish mode it was configured with.
#[derive(Clone)]
pub struct SinkBinding {
    pub sink: Arc<dyn PublishSink>,
    pub mode: PublishMode,
}

impl SinkBinding {
    pub fn new(sink: Arc<dyn PublishSink>, mode: PublishMode) -> Self {
        Self { sink, mode }
    }

    /// Whether this field goes to the sink this cycle. A field that just
    /// went absent is sent in either mode; absent fields are otherwise never sent.
    pub fn wants(&self, value: &FieldValue, is_change: bool) -> bool {
        match self.mode {
            PublishMode::Changed => is_change,
            PublishMode::All => is_change || !value.is_absent(),
        }
    }
}
