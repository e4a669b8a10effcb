use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use futures::Stream;
use tokio::sync::mpsc;
use super::types::{TaskId, TaskOutcome, TaskUpdate};

pub type ProgressObserver = Arc<dyn Fn(TaskId, u8) + Send + Sync>;
pub type CompletionObserver = Arc<dyn Fn(TaskId, &TaskOutcome) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObserverKind {
    Progress,
    Completion,
}

#[derive(Default)]
struct Observers {
    next_key: u64,
    progress: HashMap<TaskId, Vec<(u64, ProgressObserver)>>,
    completion: HashMap<TaskId, Vec<(u64, CompletionObserver)>>,
}

/// Per-task observers, shared between queue handles and the worker.
///
/// Observers are cloned out before being called so a callback may subscribe
/// or unsubscribe without deadlocking.
#[derive(Clone, Default)]
pub(crate) struct ObserverRegistry {
    inner: Arc<Mutex<Observers>>,
}

fn lock(observers: &Mutex<Observers>) -> MutexGuard<'_, Observers> {
    // A panicking observer must not take the queue down with it
    observers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ObserverRegistry {
    pub(crate) fn add_progress(&self, task_id: TaskId, observer: ProgressObserver) -> Subscription {
        let mut observers = lock(&self.inner);
        observers.next_key += 1;
        let key = observers.next_key;
        observers.progress.entry(task_id).or_default().push((key, observer));

        self.subscription(task_id, key, ObserverKind::Progress)
    }

    pub(crate) fn add_completion(&self, task_id: TaskId, observer: CompletionObserver) -> Subscription {
        let mut observers = lock(&self.inner);
        observers.next_key += 1;
        let key = observers.next_key;
        observers.completion.entry(task_id).or_default().push((key, observer));

        self.subscription(task_id, key, ObserverKind::Completion)
    }

    pub(crate) fn notify_progress(&self, task_id: TaskId, percent: u8) {
        let targets: Vec<ProgressObserver> = lock(&self.inner)
            .progress
            .get(&task_id)
            .map(|list| list.iter().map(|(_, observer)| observer.clone()).collect())
            .unwrap_or_default();

        for observer in targets {
            observer(task_id, percent);
        }
    }

    /// Fires completion observers once and drops every observer of the task
    pub(crate) fn notify_completion(&self, task_id: TaskId, outcome: &TaskOutcome) {
        let targets = {
            let mut observers = lock(&self.inner);
            observers.progress.remove(&task_id);
            observers.completion.remove(&task_id).unwrap_or_default()
        };

        for (_, observer) in targets {
            observer(task_id, outcome);
        }
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self, task_id: TaskId) -> usize {
        let observers = lock(&self.inner);
        observers.progress.get(&task_id).map_or(0, Vec::len)
            + observers.completion.get(&task_id).map_or(0, Vec::len)
    }

    fn subscription(&self, task_id: TaskId, key: u64, kind: ObserverKind) -> Subscription {
        Subscription {
            task_id,
            key,
            kind,
            registry: Arc::downgrade(&self.inner),
        }
    }
}

/// Handle returned by the subscribe calls.
///
/// Dropping it keeps the observer registered; call `unsubscribe` to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    task_id: TaskId,
    key: u64,
    kind: ObserverKind,
    registry: Weak<Mutex<Observers>>,
}

impl Subscription {
    /// Subscription with nothing registered behind it
    pub(crate) fn detached(task_id: TaskId) -> Self {
        Self {
            task_id,
            key: 0,
            kind: ObserverKind::Completion,
            registry: Weak::new(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let mut observers = lock(&registry);
        match self.kind {
            ObserverKind::Progress => {
                if let Some(list) = observers.progress.get_mut(&self.task_id) {
                    list.retain(|(key, _)| *key != self.key);
                    if list.is_empty() {
                        observers.progress.remove(&self.task_id);
                    }
                }
            }
            ObserverKind::Completion => {
                if let Some(list) = observers.completion.get_mut(&self.task_id) {
                    list.retain(|(key, _)| *key != self.key);
                    if list.is_empty() {
                        observers.completion.remove(&self.task_id);
                    }
                }
            }
        }
    }
}

/// Progress of one task as an async stream.
///
/// Yields `Progress` items and ends right after a single `Finished`.
pub struct TaskWatch {
    task_id: TaskId,
    rx: mpsc::UnboundedReceiver<TaskUpdate>,
    subscriptions: Vec<Subscription>,
    finished: bool,
}

impl TaskWatch {
    pub(crate) fn register(registry: &ObserverRegistry, task_id: TaskId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let progress_tx = tx.clone();
        let progress = registry.add_progress(task_id, Arc::new(move |_, percent: u8| {
            let _ = progress_tx.send(TaskUpdate::Progress(percent));
        }));
        let completion = registry.add_completion(task_id, Arc::new(move |_, outcome: &TaskOutcome| {
            let _ = tx.send(TaskUpdate::Finished(outcome.clone()));
        }));

        Self {
            task_id,
            rx,
            subscriptions: vec![progress, completion],
            finished: false,
        }
    }

    /// Watch over a task that already reached its terminal state
    pub(crate) fn finished(task_id: TaskId, outcome: TaskOutcome) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TaskUpdate::Finished(outcome));

        Self {
            task_id,
            rx,
            subscriptions: Vec::new(),
            finished: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Stream for TaskWatch {
    type Item = TaskUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(update)) => {
                if matches!(update, TaskUpdate::Finished(_)) {
                    self.finished = true;
                }
                Poll::Ready(Some(update))
            }
            other => other,
        }
    }
}

impl Drop for TaskWatch {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use futures::StreamExt;

    #[test]
    fn test_completion_fires_once_and_clears_observers() {
        let registry = ObserverRegistry::default();
        let task_id = TaskId::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let _subscription = registry.add_completion(task_id, {
            let calls = calls.clone();
            Arc::new(move |_, _: &TaskOutcome| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        });
        let _progress = registry.add_progress(task_id, Arc::new(|_, _: u8| {}));

        let outcome = TaskOutcome::Uploaded { url: "https://cdn/a.jpg".to_string() };
        registry.notify_completion(task_id, &outcome);
        registry.notify_completion(task_id, &outcome);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.observer_count(task_id), 0);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_observer() {
        let registry = ObserverRegistry::default();
        let task_id = TaskId::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let subscription = registry.add_progress(task_id, {
            let first = first.clone();
            Arc::new(move |_, _: u8| {
                first.fetch_add(1, Ordering::SeqCst);
            })
        });
        let _kept = registry.add_progress(task_id, {
            let second = second.clone();
            Arc::new(move |_, _: u8| {
                second.fetch_add(1, Ordering::SeqCst);
            })
        });

        registry.notify_progress(task_id, 10);
        subscription.unsubscribe();
        registry.notify_progress(task_id, 20);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observer_may_subscribe_from_callback() {
        let registry = ObserverRegistry::default();
        let task_id = TaskId::new();

        let _subscription = registry.add_progress(task_id, {
            let registry = registry.clone();
            Arc::new(move |task_id, _: u8| {
                let _ = registry.add_completion(task_id, Arc::new(|_, _: &TaskOutcome| {}));
            })
        });

        registry.notify_progress(task_id, 5);
        assert_eq!(registry.observer_count(task_id), 2);
    }

    #[tokio::test]
    async fn test_watch_ends_after_finished() {
        let registry = ObserverRegistry::default();
        let task_id = TaskId::new();
        let watch = TaskWatch::register(&registry, task_id);

        registry.notify_progress(task_id, 40);
        registry.notify_progress(task_id, 80);
        registry.notify_completion(task_id, &TaskOutcome::Uploaded { url: "u".to_string() });

        let updates: Vec<_> = watch.collect().await;
        assert_eq!(updates, vec![
            TaskUpdate::Progress(40),
            TaskUpdate::Progress(80),
            TaskUpdate::Finished(TaskOutcome::Uploaded { url: "u".to_string() }),
        ]);
    }

    #[tokio::test]
    async fn test_dropping_watch_unsubscribes() {
        let registry = ObserverRegistry::default();
        let task_id = TaskId::new();

        let watch = TaskWatch::register(&registry, task_id);
        assert_eq!(registry.observer_count(task_id), 2);

        drop(watch);
        assert_eq!(registry.observer_count(task_id), 0);
    }
}
