//! Scripted origin source for tests
//!
//! Serves a fixed byte body with configurable chunking, range support,
//! injected failures, and per-chunk delays, and records every fetch it
//! receives. Lives in the library (not behind `cfg(test)`) so integration
//! tests can drive loaders and schedulers without a network.

use crate::error::{CacheError, Result};
use crate::net::client::{BodyStream, FetchRange, RemoteInfo, RemoteResponse, RemoteSource};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory origin with scripted behavior
pub struct StubRemoteSource {
    body: Bytes,
    content_type: Option<String>,
    supports_range: bool,
    chunk_size: usize,
    chunk_delay: Option<Duration>,

    /// Fail this many fetches with a network error before succeeding
    fail_fetches: AtomicU32,
    /// Always answer with this HTTP status instead of a body
    fail_status: Mutex<Option<u16>>,
    /// Abort each body with a network error after this many bytes
    fail_body_after: Mutex<Option<usize>>,

    calls: Mutex<Vec<Option<FetchRange>>>,
}

impl StubRemoteSource {
    /// Origin serving `body` with range support and 64 KiB chunks
    pub fn new(body: impl Into<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            body: body.into(),
            content_type: Some("video/mp4".to_string()),
            supports_range: true,
            chunk_size: 64 * 1024,
            chunk_delay: None,
            fail_fetches: AtomicU32::new(0),
            fail_status: Mutex::new(None),
            fail_body_after: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Builder-style origin for fine-grained scripting
    pub fn builder(body: impl Into<Bytes>) -> StubBuilder {
        StubBuilder {
            body: body.into(),
            content_type: Some("video/mp4".to_string()),
            supports_range: true,
            chunk_size: 64 * 1024,
            chunk_delay: None,
        }
    }

    /// Fail the next `n` fetches with a network error
    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    /// Answer every fetch with `status` until cleared with `None`
    pub fn set_fail_status(&self, status: Option<u16>) {
        *self.fail_status.lock() = status;
    }

    /// Abort each body with a network error after `bytes` delivered bytes
    pub fn set_fail_body_after(&self, bytes: Option<usize>) {
        *self.fail_body_after.lock() = bytes;
    }

    /// Ranges of every fetch received so far
    pub fn calls(&self) -> Vec<Option<FetchRange>> {
        self.calls.lock().clone()
    }

    /// Number of fetches received so far
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Builder for [`StubRemoteSource`]
pub struct StubBuilder {
    body: Bytes,
    content_type: Option<String>,
    supports_range: bool,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
}

impl StubBuilder {
    /// Set the `Content-Type` the stub reports
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Whether the stub honors range requests (200 vs 206 behavior)
    pub fn supports_range(mut self, supports: bool) -> Self {
        self.supports_range = supports;
        self
    }

    /// Body chunk granularity
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Pause between body chunks, for cancellation tests
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Finish the builder
    pub fn build(self) -> Arc<StubRemoteSource> {
        Arc::new(StubRemoteSource {
            body: self.body,
            content_type: self.content_type,
            supports_range: self.supports_range,
            chunk_size: self.chunk_size,
            chunk_delay: self.chunk_delay,
            fail_fetches: AtomicU32::new(0),
            fail_status: Mutex::new(None),
            fail_body_after: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RemoteSource for StubRemoteSource {
    async fn fetch(&self, _url: &str, range: Option<FetchRange>) -> Result<RemoteResponse> {
        self.calls.lock().push(range);

        if let Some(status) = *self.fail_status.lock() {
            return Err(CacheError::HttpStatus(status));
        }
        if self
            .fail_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CacheError::Network("injected fetch failure".to_string()));
        }

        let total = self.body.len() as i64;
        let (offset, slice, status) = match range {
            Some(r) if self.supports_range => {
                if r.start >= total {
                    return Err(CacheError::HttpStatus(416));
                }
                let end = r
                    .end
                    .map(|e| e.min(total - 1))
                    .unwrap_or(total - 1);
                (
                    r.start,
                    self.body.slice(r.start as usize..=end as usize),
                    206u16,
                )
            }
            _ => (0, self.body.clone(), 200u16),
        };

        let info = RemoteInfo {
            status,
            content_type: self.content_type.clone(),
            total_length: Some(total),
            supports_range: self.supports_range,
            offset,
        };

        let fail_after = *self.fail_body_after.lock();
        let chunk_delay = self.chunk_delay;
        let chunk_size = self.chunk_size;

        let mut chunks: Vec<Result<Bytes>> = Vec::new();
        let mut delivered = 0usize;
        let mut cursor = slice;
        'outer: while !cursor.is_empty() {
            let take = chunk_size.min(cursor.len());
            let mut chunk = cursor.split_to(take);
            if let Some(limit) = fail_after {
                if delivered + chunk.len() > limit {
                    let keep = limit.saturating_sub(delivered);
                    if keep > 0 {
                        chunks.push(Ok(chunk.split_to(keep)));
                    }
                    chunks.push(Err(CacheError::Network(
                        "injected body failure".to_string(),
                    )));
                    break 'outer;
                }
            }
            delivered += chunk.len();
            chunks.push(Ok(chunk));
        }

        let body: BodyStream = match chunk_delay {
            Some(delay) => Box::pin(futures::stream::iter(chunks).then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            })),
            None => Box::pin(futures::stream::iter(chunks)),
        };

        Ok(RemoteResponse { info, body })
    }
}
