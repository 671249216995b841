//! Player-facing request surface
//!
//! The host's resource-loader interceptor turns each player callback into a
//! [`PlayerRequest`]: an optional content-info sub-request plus a data
//! sub-request for a byte span. The loader answers through an event channel
//! so the player thread never blocks on cache internals.

use crate::error::CacheError;
use crate::types::ContentInfo;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Events delivered to one player request, in order
#[derive(Debug)]
pub enum PlayerEvent {
    /// Content-info answer, sent before any data
    Info(ContentInfo),
    /// The next in-order slice of the requested span
    Data(Bytes),
    /// The request has been fully served
    Finished,
    /// Terminal failure; no further events follow
    Failed(CacheError),
}

/// One range-scoped loading request from the player
#[derive(Debug)]
pub struct PlayerRequest {
    /// Unique id, used for cancellation routing
    pub id: u64,

    /// First requested byte
    pub offset: i64,

    /// Requested byte count; `None` means "to the end of the resource"
    pub length: Option<i64>,

    /// Whether the request carries a content-info sub-request
    pub wants_content_info: bool,

    /// Event sink toward the player
    pub events: mpsc::UnboundedSender<PlayerEvent>,
}

impl PlayerRequest {
    /// Build a request and the receiver its events arrive on
    pub fn new(
        offset: i64,
        length: Option<i64>,
        wants_content_info: bool,
    ) -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                offset,
                length,
                wants_content_info,
                events,
            },
            rx,
        )
    }

    /// Requested end offset (inclusive), when the length is bounded
    pub fn end(&self) -> Option<i64> {
        self.length.map(|len| self.offset + len - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let (a, _rx_a) = PlayerRequest::new(0, Some(10), false);
        let (b, _rx_b) = PlayerRequest::new(0, Some(10), false);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_end_offset() {
        let (bounded, _rx) = PlayerRequest::new(100, Some(50), false);
        assert_eq!(bounded.end(), Some(149));
        let (open, _rx) = PlayerRequest::new(100, None, false);
        assert_eq!(open.end(), None);
    }
}
