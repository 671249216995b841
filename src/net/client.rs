//! Origin fetch seam and its HTTP implementation
//!
//! The loader talks to origins through the [`RemoteSource`] trait so tests
//! can substitute a scripted source. The production implementation wraps
//! `reqwest` with streaming bodies.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

/// Byte range of an origin request: `start` inclusive, `end` inclusive or
/// open-ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRange {
    /// First requested byte
    pub start: i64,
    /// Last requested byte, or `None` for "to the end"
    pub end: Option<i64>,
}

impl FetchRange {
    /// Open-ended range starting at `start`
    pub fn from(start: i64) -> Self {
        Self { start, end: None }
    }

    /// Header value for `Range:`
    fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// What a fetch learned from the response headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    /// HTTP status of the response
    pub status: u16,
    /// `Content-Type` header
    pub content_type: Option<String>,
    /// Total resource length: `Content-Length` for a full response, the
    /// denominator of `Content-Range` for a partial one
    pub total_length: Option<i64>,
    /// Whether the origin serves byte ranges (`Accept-Ranges: bytes` or a
    /// 206 response)
    pub supports_range: bool,
    /// Offset at which the body starts; 0 when the origin ignored the
    /// requested range
    pub offset: i64,
}

/// Streaming response body
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An origin response: parsed headers plus the streaming body
pub struct RemoteResponse {
    /// Parsed header information
    pub info: RemoteInfo,
    /// Body chunks in arrival order
    pub body: BodyStream,
}

/// Seam between the loader and the network
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
    /// Issue a GET for `url`, optionally scoped to a byte range
    ///
    /// Non-2xx statuses surface as [`CacheError::HttpStatus`] and are
    /// terminal for the current attempt.
    async fn fetch(&self, url: &str, range: Option<FetchRange>) -> Result<RemoteResponse>;
}

/// Exponential backoff policy for transient origin failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first failure
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier per retry
    pub factor: f64,
    /// Ceiling on the delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based):
    /// `min(initial * factor^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Parse a `Content-Range: bytes A-B/T` header
///
/// Returns `(first_byte, last_byte, total)`; total is `None` for `*`.
pub fn parse_content_range(value: &str) -> Option<(i64, i64, Option<i64>)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (span, total) = rest.split_once('/')?;
    let (first, last) = span.split_once('-')?;
    let first: i64 = first.trim().parse().ok()?;
    let last: i64 = last.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<i64>().ok()?),
    };
    (first <= last).then_some((first, last, total))
}

/// `reqwest`-backed origin source
pub struct HttpRemoteSource {
    client: reqwest::Client,
}

impl HttpRemoteSource {
    /// Build a source with the given request timeout and default headers
    pub fn new(request_timeout: Duration, headers: &HashMap<String, String>) -> Result<Self> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (name, value) in headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CacheError::Config(format!("invalid header name {}: {}", name, e)))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| CacheError::Config(format!("invalid header value: {}", e)))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .default_headers(header_map)
            .build()
            .map_err(|e| CacheError::Config(format!("HTTP client build failed: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch(&self, url: &str, range: Option<FetchRange>) -> Result<RemoteResponse> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CacheError::Timeout(0)
            } else {
                CacheError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::HttpStatus(status.as_u16()));
        }

        let headers = response.headers();
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_length = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());
        let content_range = headers
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let accept_ranges = headers
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        let is_partial = status == reqwest::StatusCode::PARTIAL_CONTENT;
        let (offset, total_length) = match content_range {
            Some((first, _last, total)) => (first, total.or(content_length)),
            None if is_partial => (range.map(|r| r.start).unwrap_or(0), content_length),
            None => (0, content_length),
        };

        let info = RemoteInfo {
            status: status.as_u16(),
            content_type,
            total_length,
            supports_range: is_partial || accept_ranges,
            offset,
        };

        let body: BodyStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| CacheError::Network(e.to_string()))),
        );

        Ok(RemoteResponse { info, body })
    }
}
