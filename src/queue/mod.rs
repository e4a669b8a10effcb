mod errors;
mod manager;
mod manager_worker;
mod subscription;
mod task;
mod types;

pub use errors::{QueueError, Result};
pub use manager::{QueueBuilder, UploadQueue, UploadQueueHandle};
pub use subscription::{CompletionObserver, ProgressObserver, Subscription, TaskWatch};
pub use task::{CaptureMetadata, UploadTask};
pub use types::{QueueConfig, QueueEvent, TaskId, TaskOutcome, TaskStatus, TaskUpdate};
