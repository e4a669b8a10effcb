use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use super::types::{TaskId, TaskStatus};

/// Who captured the payload, for which record, and when
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetadata {
    pub record_id: String,
    pub sub_record_id: Option<String>,
    pub actor_id: String,
    pub captured_at: DateTime<Utc>,
}

impl CaptureMetadata {
    pub fn new(record_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            sub_record_id: None,
            actor_id: actor_id.into(),
            captured_at: Utc::now(),
        }
    }

    pub fn with_sub_record(mut self, sub_record_id: impl Into<String>) -> Self {
        self.sub_record_id = Some(sub_record_id.into());
        self
    }
}

/// Delivery state of one queued payload.
///
/// This is also the record persisted in the uploads partition. The payload
/// itself never lives here; it is kept by the worker and in the blob area.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub id: TaskId,
    pub destination_name: String,
    pub metadata: CaptureMetadata,
    pub payload_size: u64,
    pub status: TaskStatus,
    pub progress: u8,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Reference returned by the sink once completed
    pub remote_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadTask {
    pub fn new(destination_name: String, metadata: CaptureMetadata, payload_size: u64) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            destination_name,
            metadata,
            payload_size,
            status: TaskStatus::Pending,
            progress: 0,
            retry_count: 0,
            last_error: None,
            remote_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (from, to),
            (Pending, Uploading)
                | (Uploading, Completed)
                | (Uploading, Pending)
                | (Uploading, Failed)
                | (Failed, Pending)
        )
    }

    /// Moves to `to` if the transition is allowed, returning the previous status
    pub fn transition(&mut self, to: TaskStatus) -> Option<TaskStatus> {
        let from = self.status;
        if !Self::is_valid_transition(from, to) {
            return None;
        }

        self.status = to;
        self.updated_at = Utc::now();
        Some(from)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Failed)
    }
}
