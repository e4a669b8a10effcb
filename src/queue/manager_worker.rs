use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use crate::store::TaskStore;
use crate::uploaders::{ProgressCallback, UploadRequest, Uploader};
use crate::utils::RetryPolicy;
use super::errors::{QueueError, Result};
use super::subscription::{ObserverRegistry, Subscription, TaskWatch};
use super::task::{CaptureMetadata, UploadTask};
use super::types::{
    ManagerCommand, Observer, QueueConfig, QueueEvent, TaskId, TaskOutcome, TaskStatus, TransferEvent,
};

const MISSING_PAYLOAD: &str = "payload missing from local store";

struct TaskEntry {
    task: UploadTask,
    /// Only held when the store does not have it; read per attempt otherwise
    payload: Option<Bytes>,
    /// Attempts started since enqueue or the last manual retry
    attempt: u32,
    /// Pending but waiting out a retry delay
    backing_off: bool,
}

/// Owns every task and is the only place task state changes.
///
/// Handles talk to it through `ManagerCommand`s; transfers and backoff
/// timers report back through `TransferEvent`s. After each message the
/// drain step refills free transfer slots in insertion order.
pub(crate) struct UploadQueueWorker {
    uploader: Arc<dyn Uploader>,
    store: Option<Arc<dyn TaskStore>>,
    config: QueueConfig,
    policy: RetryPolicy,

    tasks: HashMap<TaskId, TaskEntry>,
    order: Vec<TaskId>,
    active: HashSet<TaskId>,

    observers: ObserverRegistry,
    event_tx: broadcast::Sender<QueueEvent>,
    transfer_tx: mpsc::UnboundedSender<TransferEvent>,
    transfer_rx: mpsc::UnboundedReceiver<TransferEvent>,
    shutdown: CancellationToken,
}

impl UploadQueueWorker {
    pub(crate) fn new(
        uploader: Arc<dyn Uploader>,
        store: Option<Arc<dyn TaskStore>>,
        config: QueueConfig,
        observers: ObserverRegistry,
        event_tx: broadcast::Sender<QueueEvent>,
    ) -> Self {
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy::from(&config);

        Self {
            uploader,
            store,
            config,
            policy,
            tasks: HashMap::new(),
            order: Vec::new(),
            active: HashSet::new(),
            observers,
            event_tx,
            transfer_tx,
            transfer_rx,
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) async fn run(mut self, mut command_rx: mpsc::Receiver<ManagerCommand>) {
        self.restore().await;
        self.drain().await;

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    // Every handle dropped
                    None => break,
                },
                Some(event) = self.transfer_rx.recv() => {
                    self.handle_transfer_event(event).await;
                }
            }

            self.drain().await;
        }

        self.shutdown.cancel();
        debug!("upload queue worker stopped");
    }

    /// Reload unfinished work from the previous session
    async fn restore(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };

        let mut restored = Vec::new();
        for status in TaskStatus::ALL {
            match store.tasks_with_status(status).await {
                Ok(tasks) => restored.extend(tasks),
                Err(err) => warn!(%status, %err, "failed to load persisted tasks"),
            }
        }
        restored.sort_by_key(|task| task.created_at);

        let count = restored.len();
        for mut task in restored {
            // Interrupted mid-transfer, the sink never confirmed it
            if task.status == TaskStatus::Uploading {
                task.transition(TaskStatus::Pending);
                task.progress = 0;
            }

            let has_payload = task.status == TaskStatus::Completed
                || match store.has_payload(task.id).await {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(task_id = %task.id, %err, "failed to check payload");
                        false
                    }
                };

            if !has_payload {
                task.status = TaskStatus::Failed;
                task.last_error = Some(MISSING_PAYLOAD.to_string());
                task.updated_at = chrono::Utc::now();
            }

            let task_id = task.id;
            self.order.push(task_id);
            self.tasks.insert(task_id, TaskEntry {
                task,
                payload: None,
                attempt: 0,
                backing_off: false,
            });
            self.persist(task_id).await;
        }

        if count > 0 {
            info!(count, "restored upload tasks from local store");
        }
    }

    /// Returns false when the worker should stop
    async fn handle_command(&mut self, command: ManagerCommand) -> bool {
        match command {
            ManagerCommand::Enqueue { payload, destination_name, metadata, reply } => {
                let result = self.enqueue(payload, destination_name, metadata).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Cancel { task_id, reply } => {
                let cancelled = self.cancel(task_id).await;
                let _ = reply.send(cancelled);
            }
            ManagerCommand::Retry { task_id, reply } => {
                let retried = self.retry(task_id).await;
                let _ = reply.send(retried);
            }
            ManagerCommand::Watch { task_id, reply } => {
                let _ = reply.send(self.watch(task_id));
            }
            ManagerCommand::Subscribe { task_id, observer, reply } => {
                let _ = reply.send(self.subscribe(task_id, observer));
            }
            ManagerCommand::GetTask { task_id, reply } => {
                let task = self.tasks.get(&task_id).map(|entry| entry.task.clone());
                let _ = reply.send(task);
            }
            ManagerCommand::ListTasks { reply } => {
                let tasks = self.order
                    .iter()
                    .filter_map(|task_id| self.tasks.get(task_id))
                    .map(|entry| entry.task.clone())
                    .collect();
                let _ = reply.send(tasks);
            }
            ManagerCommand::CountByStatus { status, reply } => {
                let count = self.tasks
                    .values()
                    .filter(|entry| entry.task.status == status)
                    .count();
                let _ = reply.send(count);
            }
            ManagerCommand::ClearCompleted { reply } => {
                let removed = self.clear_completed().await;
                let _ = reply.send(removed);
            }
            ManagerCommand::Shutdown { reply } => {
                self.shutdown.cancel();
                let _ = reply.send(());
                return false;
            }
        }

        true
    }

    async fn enqueue(&mut self, payload: Bytes, destination_name: String, metadata: CaptureMetadata) -> Result<TaskId> {
        let task = UploadTask::new(destination_name, metadata, payload.len() as u64);
        let task_id = task.id;

        // Payload first, a record without its blob cannot be resumed
        let stored = match &self.store {
            Some(store) => match store.save_payload(task_id, &payload).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(%task_id, %err, "failed to persist payload, task will not survive a restart");
                    false
                }
            },
            None => false,
        };

        info!(%task_id, destination = %task.destination_name, size = task.payload_size, "upload enqueued");

        self.order.push(task_id);
        self.tasks.insert(task_id, TaskEntry {
            task,
            payload: (!stored).then_some(payload),
            attempt: 0,
            backing_off: false,
        });
        self.persist(task_id).await;
        let _ = self.event_tx.send(QueueEvent::Enqueued { task_id });

        Ok(task_id)
    }

    async fn cancel(&mut self, task_id: TaskId) -> bool {
        let Some(entry) = self.tasks.get(&task_id) else {
            return false;
        };

        if !entry.task.is_cancellable() {
            let err = QueueError::InvalidStateTransition {
                action: "cancel",
                from: entry.task.status,
            };
            debug!(%task_id, %err, "cancel refused");
            return false;
        }

        self.remove(task_id).await;
        self.observers.notify_completion(task_id, &TaskOutcome::Cancelled);
        info!(%task_id, "upload cancelled");

        true
    }

    async fn retry(&mut self, task_id: TaskId) -> bool {
        let Some(entry) = self.tasks.get(&task_id) else {
            return false;
        };

        if entry.task.status != TaskStatus::Failed {
            let err = QueueError::InvalidStateTransition {
                action: "retry",
                from: entry.task.status,
            };
            debug!(%task_id, %err, "retry refused");
            return false;
        }

        if !self.has_payload(task_id).await {
            warn!(%task_id, "cannot retry, {}", MISSING_PAYLOAD);
            return false;
        }

        let Some(entry) = self.tasks.get_mut(&task_id) else {
            return false;
        };

        entry.task.transition(TaskStatus::Pending);
        entry.task.retry_count = 0;
        entry.task.last_error = None;
        entry.task.progress = 0;
        entry.attempt = 0;
        entry.backing_off = false;

        info!(%task_id, "manual retry requested");
        self.persist(task_id).await;
        self.emit_state_change(task_id, TaskStatus::Failed, TaskStatus::Pending);

        true
    }

    fn watch(&self, task_id: TaskId) -> Option<TaskWatch> {
        let entry = self.tasks.get(&task_id)?;

        let watch = match terminal_outcome(&entry.task) {
            Some(outcome) => TaskWatch::finished(task_id, outcome),
            None => TaskWatch::register(&self.observers, task_id),
        };

        Some(watch)
    }

    /// Registration happens here so it cannot race a terminal transition
    fn subscribe(&self, task_id: TaskId, observer: Observer) -> Option<Subscription> {
        let entry = self.tasks.get(&task_id)?;

        let subscription = match (observer, terminal_outcome(&entry.task)) {
            (Observer::Progress(observer), None) => self.observers.add_progress(task_id, observer),
            (Observer::Completion(observer), None) => self.observers.add_completion(task_id, observer),
            (Observer::Progress(_), Some(_)) => Subscription::detached(task_id),
            (Observer::Completion(observer), Some(outcome)) => {
                observer(task_id, &outcome);
                Subscription::detached(task_id)
            }
        };

        Some(subscription)
    }

    async fn clear_completed(&mut self) -> usize {
        let completed: Vec<TaskId> = self.order
            .iter()
            .copied()
            .filter(|task_id| {
                self.tasks
                    .get(task_id)
                    .is_some_and(|entry| entry.task.status == TaskStatus::Completed)
            })
            .collect();

        for task_id in &completed {
            self.remove(*task_id).await;
        }

        if !completed.is_empty() {
            debug!(count = completed.len(), "cleared completed uploads");
        }

        completed.len()
    }

    /// Drop a task from memory and from the local store
    async fn remove(&mut self, task_id: TaskId) {
        self.tasks.remove(&task_id);
        self.order.retain(|id| *id != task_id);

        if let Some(store) = &self.store {
            if let Err(err) = store.delete_task(task_id).await {
                warn!(%task_id, %err, "failed to delete persisted task");
            }
        }

        let _ = self.event_tx.send(QueueEvent::Removed { task_id });
    }

    /// Fill free slots with the oldest eligible tasks
    async fn drain(&mut self) {
        while self.active.len() < self.config.concurrency.max(1) {
            let Some(task_id) = self.next_eligible() else {
                break;
            };
            self.start_attempt(task_id).await;
        }
    }

    fn next_eligible(&self) -> Option<TaskId> {
        self.order.iter().copied().find(|task_id| {
            !self.active.contains(task_id)
                && self.tasks.get(task_id).is_some_and(|entry| {
                    entry.task.status == TaskStatus::Pending && !entry.backing_off
                })
        })
    }

    async fn start_attempt(&mut self, task_id: TaskId) {
        let Some(payload) = self.load_payload(task_id).await else {
            self.fail_missing_payload(task_id).await;
            return;
        };

        let Some(entry) = self.tasks.get_mut(&task_id) else {
            return;
        };

        let Some(old_status) = entry.task.transition(TaskStatus::Uploading) else {
            return;
        };
        entry.task.progress = 0;
        entry.attempt += 1;

        let attempt = entry.attempt;
        let request = UploadRequest {
            task_id,
            destination_name: entry.task.destination_name.clone(),
            metadata: entry.task.metadata.clone(),
            payload,
        };

        self.active.insert(task_id);
        debug!(%task_id, attempt, active = self.active.len(), "starting transfer");

        self.persist(task_id).await;
        self.emit_state_change(task_id, old_status, TaskStatus::Uploading);

        let transfer_tx = self.transfer_tx.clone();
        let progress: ProgressCallback = {
            let transfer_tx = transfer_tx.clone();
            Arc::new(move |percent| {
                let _ = transfer_tx.send(TransferEvent::Progress { task_id, attempt, percent });
            })
        };

        let uploader = self.uploader.clone();
        let timeout = self.config.transfer_timeout;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let transfer = tokio::time::timeout(timeout, uploader.upload(request, progress));

            let result = tokio::select! {
                result = transfer => match result {
                    Ok(result) => result,
                    Err(_) => Err(QueueError::Timeout(timeout)),
                },
                // Abandoned, the persisted `uploading` status re-queues it on restart
                _ = shutdown.cancelled() => return,
            };

            let _ = transfer_tx.send(TransferEvent::Finished { task_id, attempt, result });
        });
    }

    async fn handle_transfer_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Progress { task_id, attempt, percent } => {
                self.apply_progress(task_id, attempt, percent);
            }
            TransferEvent::Finished { task_id, attempt, result } => {
                self.finish_attempt(task_id, attempt, result).await;
            }
            TransferEvent::RetryDue { task_id, attempt } => {
                if let Some(entry) = self.tasks.get_mut(&task_id) {
                    if entry.attempt == attempt && entry.task.status == TaskStatus::Pending {
                        entry.backing_off = false;
                        debug!(%task_id, "retry delay elapsed");
                    }
                }
            }
        }
    }

    fn apply_progress(&mut self, task_id: TaskId, attempt: u32, percent: u8) {
        let Some(entry) = self.tasks.get_mut(&task_id) else {
            return;
        };

        let current = entry.task.status == TaskStatus::Uploading && entry.attempt == attempt;
        let percent = percent.min(100);
        if !current || percent <= entry.task.progress {
            return;
        }

        entry.task.progress = percent;
        entry.task.updated_at = chrono::Utc::now();

        self.observers.notify_progress(task_id, percent);
        let _ = self.event_tx.send(QueueEvent::Progress { task_id, percent });
    }

    async fn finish_attempt(&mut self, task_id: TaskId, attempt: u32, result: Result<String>) {
        let Some(entry) = self.tasks.get_mut(&task_id) else {
            return;
        };

        // Duplicate or stale completion, terminal state is already settled
        if entry.task.status != TaskStatus::Uploading || entry.attempt != attempt {
            debug!(%task_id, attempt, status = %entry.task.status, "ignoring stale transfer result");
            return;
        }
        self.active.remove(&task_id);

        match result {
            Ok(url) => {
                entry.task.transition(TaskStatus::Completed);
                entry.task.progress = 100;
                entry.task.last_error = None;
                entry.task.remote_url = Some(url.clone());
                entry.payload = None;

                info!(%task_id, %url, retries = entry.task.retry_count, "upload completed");

                self.persist(task_id).await;
                self.emit_state_change(task_id, TaskStatus::Uploading, TaskStatus::Completed);
                self.observers.notify_completion(task_id, &TaskOutcome::Uploaded { url: url.clone() });
                let _ = self.event_tx.send(QueueEvent::Completed { task_id, url });
            }
            Err(err) => {
                entry.task.retry_count += 1;
                entry.task.last_error = Some(err.to_string());
                let failures = entry.task.retry_count;

                if self.policy.is_exhausted(failures) {
                    entry.task.transition(TaskStatus::Failed);

                    let exhausted = QueueError::RetriesExhausted {
                        attempts: failures,
                        last_error: err.to_string(),
                    };
                    error!(%task_id, %exhausted, "upload failed");

                    self.persist(task_id).await;
                    self.emit_state_change(task_id, TaskStatus::Uploading, TaskStatus::Failed);
                    self.observers.notify_completion(task_id, &TaskOutcome::Failed {
                        error: err.to_string(),
                        attempts: failures,
                    });
                    let _ = self.event_tx.send(QueueEvent::Failed {
                        task_id,
                        error: err.to_string(),
                    });
                } else {
                    entry.task.transition(TaskStatus::Pending);
                    entry.backing_off = true;

                    let delay = self.policy.delay_for(failures);
                    warn!(%task_id, %err, failures, ?delay, "transfer failed, retrying");

                    self.persist(task_id).await;
                    self.emit_state_change(task_id, TaskStatus::Uploading, TaskStatus::Pending);
                    self.schedule_retry(task_id, attempt, delay);
                }
            }
        }
    }

    /// In-memory payload if held, else read from the store for this attempt only
    async fn load_payload(&self, task_id: TaskId) -> Option<Bytes> {
        let entry = self.tasks.get(&task_id)?;
        if let Some(payload) = &entry.payload {
            return Some(payload.clone());
        }

        let store = self.store.as_ref()?;
        match store.load_payload(task_id).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%task_id, %err, "failed to load payload");
                None
            }
        }
    }

    async fn has_payload(&self, task_id: TaskId) -> bool {
        let Some(entry) = self.tasks.get(&task_id) else {
            return false;
        };
        if entry.payload.is_some() {
            return true;
        }

        match &self.store {
            Some(store) => store.has_payload(task_id).await.unwrap_or_else(|err| {
                warn!(%task_id, %err, "failed to check payload");
                false
            }),
            None => false,
        }
    }

    async fn fail_missing_payload(&mut self, task_id: TaskId) {
        let Some(entry) = self.tasks.get_mut(&task_id) else {
            return;
        };
        let old_status = entry.task.status;
        entry.task.status = TaskStatus::Failed;
        entry.task.last_error = Some(MISSING_PAYLOAD.to_string());
        entry.task.updated_at = chrono::Utc::now();
        let attempts = entry.task.retry_count;

        error!(%task_id, "{}", MISSING_PAYLOAD);

        self.persist(task_id).await;
        self.emit_state_change(task_id, old_status, TaskStatus::Failed);
        self.observers.notify_completion(task_id, &TaskOutcome::Failed {
            error: MISSING_PAYLOAD.to_string(),
            attempts,
        });
        let _ = self.event_tx.send(QueueEvent::Failed {
            task_id,
            error: MISSING_PAYLOAD.to_string(),
        });
    }

    fn schedule_retry(&self, task_id: TaskId, attempt: u32, delay: std::time::Duration) {
        let transfer_tx = self.transfer_tx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = transfer_tx.send(TransferEvent::RetryDue { task_id, attempt });
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Write the task record through to the local store.
    ///
    /// Failures are logged, not returned: the in-memory state stays
    /// authoritative for this session.
    async fn persist(&self, task_id: TaskId) {
        let (Some(store), Some(entry)) = (&self.store, self.tasks.get(&task_id)) else {
            return;
        };

        if let Err(err) = store.save_task(&entry.task).await {
            warn!(%task_id, %err, "failed to persist task state, latest state is not durable");
        }
    }

    fn emit_state_change(&self, task_id: TaskId, old_status: TaskStatus, new_status: TaskStatus) {
        let _ = self.event_tx.send(QueueEvent::StateChanged {
            task_id,
            old_status,
            new_status,
        });
    }
}

fn terminal_outcome(task: &UploadTask) -> Option<TaskOutcome> {
    match task.status {
        TaskStatus::Completed => Some(TaskOutcome::Uploaded {
            url: task.remote_url.clone().unwrap_or_default(),
        }),
        TaskStatus::Failed => Some(TaskOutcome::Failed {
            error: task.last_error.clone().unwrap_or_default(),
            attempts: task.retry_count,
        }),
        TaskStatus::Pending | TaskStatus::Uploading => None,
    }
}
