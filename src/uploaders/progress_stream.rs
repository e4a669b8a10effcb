use std::pin::Pin;
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use super::ProgressCallback;

pin_project! {
    /// Reports integer percent as the wrapped body is consumed.
    ///
    /// Percent stops at 99: reaching 100 is reserved for the sink accepting
    /// the upload.
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        total_bytes: u64,
        bytes_sent: u64,
        last_percent: u8,
        callback: ProgressCallback,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, total_bytes: u64, callback: ProgressCallback) -> Self {
        Self {
            inner,
            total_bytes,
            bytes_sent: 0,
            last_percent: 0,
            callback,
        }
    }
}

impl<S, E> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        let poll = this.inner.poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &poll {
            *this.bytes_sent += chunk.len() as u64;

            if *this.total_bytes > 0 {
                let percent = (*this.bytes_sent * 100 / *this.total_bytes).min(99) as u8;
                if percent > *this.last_percent {
                    *this.last_percent = percent;
                    (this.callback)(percent);
                }
            }
        }

        poll
    }
}

/// Splits a payload into `chunk_size` slices without copying
pub fn chunked_payload(
    payload: Bytes,
    chunk_size: usize,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    let chunk_size = chunk_size.max(1);
    let len = payload.len();
    let chunks = (0..len)
        .step_by(chunk_size)
        .map(move |start| Ok(payload.slice(start..(start + chunk_size).min(len))));

    futures::stream::iter(chunks)
}
