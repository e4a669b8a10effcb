mod local;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;
use crate::queue::{Result, TaskId, TaskStatus, UploadTask};

pub use local::{LocalStore, DEFAULT_MAX_RECORD_BYTES};

/// Named collections inside the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// In-progress domain state, keyed by record id
    Snapshots,
    /// Upload task records, indexed by `status`
    Uploads,
}

impl Partition {
    pub const ALL: [Partition; 2] = [Partition::Snapshots, Partition::Uploads];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Partition::Snapshots => "snapshots",
            Partition::Uploads => "uploads",
        }
    }

    /// Fields with a secondary index
    pub fn indexes(&self) -> &'static [&'static str] {
        match self {
            Partition::Snapshots => &[],
            Partition::Uploads => &["status"],
        }
    }
}

/// Persistence used by the queue worker to survive restarts
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Upsert the task record
    async fn save_task(&self, task: &UploadTask) -> Result<()>;

    /// Store the payload apart from the record
    async fn save_payload(&self, task_id: TaskId, payload: &Bytes) -> Result<()>;

    async fn load_payload(&self, task_id: TaskId) -> Result<Option<Bytes>>;

    /// Whether a payload is stored, without reading it
    async fn has_payload(&self, task_id: TaskId) -> Result<bool>;

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<UploadTask>>;

    /// Remove the record and its payload
    async fn delete_task(&self, task_id: TaskId) -> Result<()>;
}

#[async_trait]
impl TaskStore for LocalStore {
    async fn save_task(&self, task: &UploadTask) -> Result<()> {
        let record = serde_json::to_value(task)?;
        self.put(Partition::Uploads, &task.id.to_string(), &record).await
    }

    async fn save_payload(&self, task_id: TaskId, payload: &Bytes) -> Result<()> {
        self.put_blob(&task_id.to_string(), payload).await
    }

    async fn load_payload(&self, task_id: TaskId) -> Result<Option<Bytes>> {
        self.get_blob(&task_id.to_string()).await
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<UploadTask>> {
        let records = self.query_by_index(Partition::Uploads, "status", status.as_str()).await?;

        // One undecodable record must not hide the rest of the bucket
        let tasks = records
            .into_iter()
            .filter_map(|record| match serde_json::from_value::<UploadTask>(record) {
                Ok(task) => Some(task),
                Err(err) => {
                    warn!(%status, %err, "skipping undecodable upload record");
                    None
                }
            })
            .collect();

        Ok(tasks)
    }

    async fn has_payload(&self, task_id: TaskId) -> Result<bool> {
        self.has_blob(&task_id.to_string()).await
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<()> {
        let id = task_id.to_string();
        self.delete(Partition::Uploads, &id).await?;
        self.delete_blob(&id).await
    }
}
