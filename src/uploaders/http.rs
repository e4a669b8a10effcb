use std::time::Duration;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, LOCATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde::Deserialize;
use tracing::debug;
use url::Url;
use crate::queue::{QueueError, Result};
use super::progress_stream::{ProgressStream, chunked_payload};
use super::{ProgressCallback, UploadRequest, Uploader};

#[derive(Debug, Clone)]
pub struct HttpUploaderConfig {
    /// Request timeout handed to the HTTP client
    pub timeout: Duration,
    /// Size of body slices, also the progress granularity
    pub chunk_size: usize,
    /// Sent as `Authorization: Bearer <token>`
    pub token: Option<String>,
}

impl Default for HttpUploaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            chunk_size: 64 * 1024,
            token: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: Option<String>,
}

/// Multipart upload to a single HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
    endpoint: Url,
    config: HttpUploaderConfig,
}

impl HttpUploader {
    pub fn new(endpoint: &str, config: HttpUploaderConfig) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| QueueError::Config(format!("invalid endpoint {}: {}", endpoint, err)))?;
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn build_form(&self, request: UploadRequest, progress: ProgressCallback) -> Form {
        let total = request.payload.len() as u64;
        let stream = ProgressStream::new(
            chunked_payload(request.payload, self.config.chunk_size),
            total,
            progress,
        );

        let file = Part::stream_with_length(Body::wrap_stream(stream), total)
            .file_name(request.destination_name);

        let metadata = request.metadata;
        let mut form = Form::new()
            .part("file", file)
            .text("taskId", request.task_id.to_string())
            .text("recordId", metadata.record_id)
            .text("actorId", metadata.actor_id)
            .text("capturedAt", metadata.captured_at.to_rfc3339());

        if let Some(sub_record_id) = metadata.sub_record_id {
            form = form.text("subRecordId", sub_record_id);
        }

        form
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, request: UploadRequest, progress: ProgressCallback) -> Result<String> {
        let task_id = request.task_id;
        let form = self.build_form(request, progress);

        let mut builder = self.client.post(self.endpoint.clone()).multipart(form);
        if let Some(token) = &self.config.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let message = if message.is_empty() {
                format!("upload rejected with status {}", status)
            } else {
                message.chars().take(512).collect()
            };
            return Err(QueueError::server_error(status.as_u16(), message));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(String::from);

        let body = response.bytes().await?;
        let url = serde_json::from_slice::<UploadResponse>(&body)
            .ok()
            .and_then(|parsed| parsed.url)
            .or(location)
            .unwrap_or_else(|| self.endpoint.to_string());

        debug!(%task_id, %url, "upload accepted");

        Ok(url)
    }
}
