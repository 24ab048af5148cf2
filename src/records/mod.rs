pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Id of a persisted call record.
pub type RecordId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Fields written when a call attempt starts.
#[derive(Debug, Clone, Serialize)]
pub struct NewCallRecord {
    pub direction: CallDirection,
    pub target: String,
    pub started_at: DateTime<Utc>,
}

/// Partial update of a call record. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallRecordUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    /// Opaque outcome tag chosen by the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

/// Backend holding call records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_record(&self, record: NewCallRecord) -> Result<RecordId, RecordError>;
    async fn update_record(&self, id: &str, update: CallRecordUpdate) -> Result<(), RecordError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Record request failed: {0}")]
    Request(String),
    #[error("Record store returned error: {0}")]
    Api(String),
    #[error("Failed to parse record response: {0}")]
    Parse(String),
}
