pub mod config;
pub mod queue;
pub mod store;
pub mod uploaders;
pub mod utils;

pub use queue::{
    CaptureMetadata,
    QueueBuilder,
    QueueConfig,
    QueueError,
    QueueEvent,
    Result,
    Subscription,
    TaskId,
    TaskOutcome,
    TaskStatus,
    TaskUpdate,
    TaskWatch,
    UploadQueue,
    UploadQueueHandle,
    UploadTask,
};

pub use store::{LocalStore, Partition, TaskStore};

pub use uploaders::{
    HttpUploader,
    HttpUploaderConfig,
    Uploader,
    UploadRequest,
};
