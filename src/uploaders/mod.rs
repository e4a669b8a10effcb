mod http;
mod progress_stream;

use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use crate::queue::{CaptureMetadata, Result, TaskId};

pub use http::{HttpUploader, HttpUploaderConfig};
pub use progress_stream::{ProgressStream, chunked_payload};

/// Receives integer percent while a transfer is running
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Everything an uploader needs for one attempt
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub task_id: TaskId,
    pub destination_name: String,
    pub metadata: CaptureMetadata,
    pub payload: Bytes,
}

/// Remote sink for queued payloads.
///
/// One call is one attempt; retries are driven by the queue. Returns the
/// remote reference on success.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, request: UploadRequest, progress: ProgressCallback) -> Result<String>;
}
