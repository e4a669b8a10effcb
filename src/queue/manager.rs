use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use super::errors::{QueueError, Result};
use super::manager_worker::UploadQueueWorker;
use super::subscription::{ObserverRegistry, Subscription, TaskWatch};
use super::task::{CaptureMetadata, UploadTask};
use super::types::{ManagerCommand, Observer, QueueConfig, QueueEvent, TaskId, TaskOutcome, TaskStatus};
use crate::store::TaskStore;
use crate::uploaders::Uploader;

/// Handle to a running upload queue.
///
/// Cheap to clone; every clone talks to the same worker. Build one at the
/// composition root with [`QueueBuilder`] and hand clones to producers.
#[derive(Clone)]
pub struct UploadQueue {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<QueueEvent>,
    durable: bool,
}

/// Queue handle plus the worker task driving it
pub struct UploadQueueHandle {
    pub queue: UploadQueue,
    pub worker_handle: JoinHandle<()>,
}

impl UploadQueueHandle {
    /// Stop the worker and wait for it to exit
    pub async fn shutdown(self) -> Result<()> {
        // Already stopped if every sender side is gone
        let _ = self.queue.shutdown().await;
        self.worker_handle
            .await
            .map_err(|err| QueueError::Internal(format!("Worker panic: {}", err)))
    }
}

#[derive(Default)]
pub struct QueueBuilder {
    config: QueueConfig,
    uploader: Option<Arc<dyn Uploader>>,
    store: Option<Arc<dyn TaskStore>>,
}

impl QueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Without a store the queue runs in memory only and loses its work on restart
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<UploadQueueHandle> {
        let uploader = self.uploader
            .ok_or_else(|| QueueError::Config("an uploader is required".to_string()))?;
        if self.config.concurrency == 0 {
            return Err(QueueError::Config("concurrency must be at least 1".to_string()));
        }

        let (command_tx, command_rx) = mpsc::channel(100);
        let (event_tx, _) = broadcast::channel(self.config.event_buffer.max(1));
        let durable = self.store.is_some();

        let worker = UploadQueueWorker::new(
            uploader,
            self.store,
            self.config,
            ObserverRegistry::default(),
            event_tx.clone(),
        );
        let worker_handle = tokio::spawn(worker.run(command_rx));

        let queue = UploadQueue {
            command_tx,
            event_tx,
            durable,
        };

        Ok(UploadQueueHandle {
            queue,
            worker_handle,
        })
    }
}

impl UploadQueue {
    pub fn builder() -> QueueBuilder {
        QueueBuilder::new()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| QueueError::ManagerShutdown)?;

        reply_rx.await.map_err(|_| QueueError::ManagerShutdown)
    }

    /// Queue a payload for delivery. Returns as soon as the task is recorded.
    pub async fn enqueue(
        &self,
        payload: impl Into<Bytes>,
        destination_name: impl Into<String>,
        metadata: CaptureMetadata,
    ) -> Result<TaskId> {
        let payload = payload.into();
        let destination_name = destination_name.into();

        self.request(|reply| ManagerCommand::Enqueue {
            payload,
            destination_name,
            metadata,
            reply,
        })
        .await?
    }

    /// Called with every progress increase of the task, in order.
    /// `None` if the task is unknown.
    pub async fn subscribe_progress<F>(&self, task_id: TaskId, callback: F) -> Result<Option<Subscription>>
    where
        F: Fn(TaskId, u8) + Send + Sync + 'static,
    {
        let observer = Observer::Progress(Arc::new(callback));
        self.request(|reply| ManagerCommand::Subscribe { task_id, observer, reply }).await
    }

    /// Called exactly once when the task completes, exhausts its retries, or
    /// is cancelled. A task already in a terminal state calls it before this
    /// returns. `None` if the task is unknown.
    pub async fn subscribe_completion<F>(&self, task_id: TaskId, callback: F) -> Result<Option<Subscription>>
    where
        F: Fn(TaskId, &TaskOutcome) + Send + Sync + 'static,
    {
        let observer = Observer::Completion(Arc::new(callback));
        self.request(|reply| ManagerCommand::Subscribe { task_id, observer, reply }).await
    }

    /// Progress of one task as a stream, `None` if the task is unknown.
    ///
    /// A task already in a terminal state yields its outcome right away.
    pub async fn watch(&self, task_id: TaskId) -> Result<Option<TaskWatch>> {
        self.request(|reply| ManagerCommand::Watch { task_id, reply }).await
    }

    /// Queue-wide event feed. Slow receivers may observe `Lagged`.
    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<UploadTask>> {
        self.request(|reply| ManagerCommand::GetTask { task_id, reply }).await
    }

    /// All tasks in enqueue order
    pub async fn list_tasks(&self) -> Result<Vec<UploadTask>> {
        self.request(|reply| ManagerCommand::ListTasks { reply }).await
    }

    /// Tasks not yet started, including those waiting to retry
    pub async fn pending_count(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::CountByStatus {
            status: TaskStatus::Pending,
            reply,
        })
        .await
    }

    pub async fn failed_count(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::CountByStatus {
            status: TaskStatus::Failed,
            reply,
        })
        .await
    }

    /// Remove a `pending` or `failed` task. Returns false for a task in
    /// flight, a completed task, or an unknown id.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        self.request(|reply| ManagerCommand::Cancel { task_id, reply }).await
    }

    /// Put a `failed` task back in the queue with a fresh retry budget
    pub async fn retry(&self, task_id: TaskId) -> Result<bool> {
        self.request(|reply| ManagerCommand::Retry { task_id, reply }).await
    }

    /// Purge completed tasks and their persisted records, returns how many
    pub async fn clear_completed(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::ClearCompleted { reply }).await
    }

    /// Whether task state is written through to a local store
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| ManagerCommand::Shutdown { reply }).await
    }
}
