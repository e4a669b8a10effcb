use std::time::Duration;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use super::errors::Result;
use super::subscription::{CompletionObserver, ProgressObserver, Subscription, TaskWatch};
use super::task::{CaptureMetadata, UploadTask};

// Durations travel through config files as milliseconds
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

fn serialize_optional_duration<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match duration {
        Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

/// Upload task identifier, assigned at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a slot, or waiting out a retry backoff
    Pending,
    /// Transfer in flight
    Uploading,
    Completed,
    /// Retries exhausted, waiting for a manual retry or cancel
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Uploading,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Value stored in the `status` index of the uploads partition
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result delivered to completion observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Remote reference returned by the sink
    Uploaded { url: String },
    Failed { error: String, attempts: u32 },
    /// Removed by `cancel` before reaching a terminal state
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Uploaded { .. })
    }
}

/// Item produced by a per-task watch stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdate {
    Progress(u8),
    Finished(TaskOutcome),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of simultaneous transfers
    pub concurrency: usize,

    /// Attempts before a task is parked as failed
    pub max_retries: u32,

    /// Linear backoff step: the n-th failure waits `retry_base_delay * n`
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub retry_base_delay: Duration,

    #[serde(serialize_with = "serialize_optional_duration", deserialize_with = "deserialize_optional_duration")]
    pub retry_max_delay: Option<Duration>,

    /// Upper bound for a single transfer attempt
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub transfer_timeout: Duration,

    /// Capacity of the queue-wide broadcast channel
    pub event_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(2000),
            retry_max_delay: None,
            transfer_timeout: Duration::from_secs(60),
            event_buffer: 256,
        }
    }
}

/// Queue-wide events
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued {
        task_id: TaskId,
    },

    StateChanged {
        task_id: TaskId,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },

    Progress {
        task_id: TaskId,
        percent: u8,
    },

    Completed {
        task_id: TaskId,
        url: String,
    },

    Failed {
        task_id: TaskId,
        error: String,
    },

    /// Task dropped from the queue by cancel or clear_completed
    Removed {
        task_id: TaskId,
    },
}

/// Observer handed to the worker by the subscribe calls
pub(crate) enum Observer {
    Progress(ProgressObserver),
    Completion(CompletionObserver),
}

/// Commands sent from `UploadQueue` handles to the worker
pub(crate) enum ManagerCommand {
    Enqueue {
        payload: Bytes,
        destination_name: String,
        metadata: CaptureMetadata,
        reply: oneshot::Sender<Result<TaskId>>,
    },

    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },

    Retry {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },

    Watch {
        task_id: TaskId,
        reply: oneshot::Sender<Option<TaskWatch>>,
    },

    Subscribe {
        task_id: TaskId,
        observer: Observer,
        reply: oneshot::Sender<Option<Subscription>>,
    },

    GetTask {
        task_id: TaskId,
        reply: oneshot::Sender<Option<UploadTask>>,
    },

    ListTasks {
        reply: oneshot::Sender<Vec<UploadTask>>,
    },

    CountByStatus {
        status: TaskStatus,
        reply: oneshot::Sender<usize>,
    },

    /// Purge completed tasks, replies with the number removed
    ClearCompleted {
        reply: oneshot::Sender<usize>,
    },

    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Messages from transfer attempts and backoff timers back into the worker
#[derive(Debug)]
pub(crate) enum TransferEvent {
    Progress {
        task_id: TaskId,
        attempt: u32,
        percent: u8,
    },

    Finished {
        task_id: TaskId,
        attempt: u32,
        result: Result<String>,
    },

    RetryDue {
        task_id: TaskId,
        attempt: u32,
    },
}

// Everything crossing the worker boundary must be Send
#[allow(dead_code)]
const _: () = {
    fn assert_send<T: Send>() {}
    fn assert_types() {
        assert_send::<ManagerCommand>();
        assert_send::<QueueEvent>();
        assert_send::<TaskUpdate>();
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_roundtrips_through_display() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let value = serde_json::to_value(TaskStatus::Uploading).unwrap();
        assert_eq!(value, serde_json::json!("uploading"));
        for status in TaskStatus::ALL {
            assert_eq!(serde_json::to_value(status).unwrap(), serde_json::json!(status.as_str()));
        }
    }

    #[test]
    fn test_queue_config_reads_milliseconds() {
        let config: QueueConfig = toml::from_str(
            "concurrency = 4\nretry_base_delay = 250\nretry_max_delay = 1000\n"
        ).unwrap();

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(250));
        assert_eq!(config.retry_max_delay, Some(Duration::from_millis(1000)));
        assert_eq!(config.transfer_timeout, Duration::from_secs(60));
    }
}
