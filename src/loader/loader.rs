//! Per-resource loader: mixes cached reads with one origin byte-range
//! session
//!
//! Each active resource gets one loader task. The task owns a command
//! channel (attachments, detachments, cancellation) and at most one
//! in-flight origin session, and multiplexes both in a single receive loop:
//! commands are handled between network chunks, a cancelled loader stops
//! within one chunk boundary, and retry sleeps are interruptible.
//!
//! Attached player requests are served in offset order: whatever the cache
//! already holds is sent immediately; the rest rides along the streaming
//! session, which always starts at the first missing offset the
//! attachments need. Preload attachments carry no event channel; they
//! resolve once the resource's prefix is on disk.

use crate::cache::CacheCore;
use crate::error::{CacheError, Result};
use crate::loader::hls;
use crate::loader::request::{PlayerEvent, PlayerRequest};
use crate::net::{FetchRange, RemoteSource, RetryPolicy};
use crate::ranges::ByteRange;
use crate::types::{ContentInfo, ResourceKey, ResourcePriority};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

static NEXT_PRELOAD_ID: AtomicU64 = AtomicU64::new(1);

/// An HLS segment discovered inside a fetched playlist
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    /// Absolute segment URL
    pub url: String,
    /// Priority inherited from the playlist's loader
    pub priority: ResourcePriority,
}

/// Capabilities shared by every loader
#[derive(Clone)]
pub struct LoaderContext {
    /// Cache the loader reads from and writes through
    pub core: Arc<CacheCore>,
    /// Origin source
    pub remote: Arc<dyn RemoteSource>,
    /// Backoff policy for transient origin failures
    pub retry: RetryPolicy,
    /// Byte budget handed to every write
    pub budget: u64,
    /// Sink for HLS segments discovered in playlists
    pub segments: Option<mpsc::UnboundedSender<SegmentRequest>>,
}

enum LoaderCommand {
    Attach(PlayerRequest),
    Detach(u64),
    Preload {
        id: u64,
        length: Option<i64>,
        priority: ResourcePriority,
        done: oneshot::Sender<Result<()>>,
    },
    CancelPreload(u64),
    Cancel,
}

/// Receipt for a preload attachment
pub struct PreloadTicket {
    /// Attachment id, for cancellation
    pub id: u64,
    /// Resolves when the preload finishes, fails, or is cancelled
    pub done: oneshot::Receiver<Result<()>>,
}

/// Handle to a running loader task
#[derive(Clone)]
pub struct Loader {
    key: ResourceKey,
    url: String,
    commands: mpsc::UnboundedSender<LoaderCommand>,
    attachments: Arc<AtomicUsize>,
}

impl Loader {
    /// Spawn the loader task for one resource
    pub fn spawn(key: ResourceKey, url: String, ctx: LoaderContext) -> Self {
        let (commands, cmd_rx) = mpsc::unbounded_channel();
        let attachments = Arc::new(AtomicUsize::new(0));

        let task = LoaderTask {
            key: key.clone(),
            url: url.clone(),
            ctx,
            attachments: Arc::clone(&attachments),
            requests: Vec::new(),
            preloads: Vec::new(),
            preload_priority: ResourcePriority::Normal,
            hls_scanned: false,
        };
        tokio::spawn(task.run(cmd_rx));

        Self {
            key,
            url,
            commands,
            attachments,
        }
    }

    /// Resource key this loader serves
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Origin URL this loader fetches from
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Attach a player request
    pub fn attach(&self, request: PlayerRequest) {
        self.attachments.fetch_add(1, Ordering::SeqCst);
        if let Err(rejected) = self.commands.send(LoaderCommand::Attach(request)) {
            self.attachments.fetch_sub(1, Ordering::SeqCst);
            if let LoaderCommand::Attach(request) = rejected.0 {
                let _ = request.events.send(PlayerEvent::Failed(CacheError::ChannelClosed(
                    "loader gone".to_string(),
                )));
            }
        }
    }

    /// Detach a player request by id; no further events are sent to it
    pub fn detach(&self, request_id: u64) {
        let _ = self.commands.send(LoaderCommand::Detach(request_id));
    }

    /// Attach a preload for the first `length` bytes (entire resource when
    /// `None`)
    pub fn preload(&self, length: Option<i64>, priority: ResourcePriority) -> PreloadTicket {
        let id = NEXT_PRELOAD_ID.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        self.attachments.fetch_add(1, Ordering::SeqCst);
        if self
            .commands
            .send(LoaderCommand::Preload {
                id,
                length,
                priority,
                done: done_tx,
            })
            .is_err()
        {
            self.attachments.fetch_sub(1, Ordering::SeqCst);
            // done_tx dropped inside the rejected command: the ticket
            // resolves with a channel error.
        }
        PreloadTicket { id, done: done_rx }
    }

    /// Cancel one preload attachment; its ticket resolves cancelled
    pub fn cancel_preload(&self, preload_id: u64) {
        let _ = self.commands.send(LoaderCommand::CancelPreload(preload_id));
    }

    /// Cancel the loader: every attachment fails with `Cancelled`, the
    /// origin session stops, already-written bytes stay cached
    pub fn cancel(&self) {
        let _ = self.commands.send(LoaderCommand::Cancel);
    }

    /// Number of live attachments; non-suspending, safe from player
    /// callbacks
    pub fn attachment_count(&self) -> usize {
        self.attachments.load(Ordering::SeqCst)
    }
}

struct AttachedRequest {
    request: PlayerRequest,
    next_offset: i64,
    sent_info: bool,
}

struct PreloadAttachment {
    id: u64,
    /// Inclusive end of the wanted prefix; `None` until bounded by the
    /// total length
    end: Option<i64>,
    done: Option<oneshot::Sender<Result<()>>>,
}

enum SessionEnd {
    /// Body drained normally
    Completed { delivered: u64 },
    /// Every attachment retired mid-session; the fetch was dropped
    Idle,
    Cancelled,
    Failed(CacheError),
}

/// Inclusive end a request is owed, given what is known about the total
fn effective_end(requested_end: Option<i64>, total: Option<i64>) -> Option<i64> {
    match (requested_end, total) {
        (Some(e), Some(t)) => Some(e.min(t - 1)),
        (Some(e), None) => Some(e),
        (None, Some(t)) => Some(t - 1),
        (None, None) => None,
    }
}

struct LoaderTask {
    key: ResourceKey,
    url: String,
    ctx: LoaderContext,
    attachments: Arc<AtomicUsize>,
    requests: Vec<AttachedRequest>,
    preloads: Vec<PreloadAttachment>,
    preload_priority: ResourcePriority,
    hls_scanned: bool,
}

impl LoaderTask {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<LoaderCommand>) {
        debug!(key = %self.key, "loader started");
        let mut cancelled = false;

        'main: loop {
            if let Err(e) = self.service_from_cache().await {
                warn!(key = %self.key, error = %e, "cache service failed");
                self.fail_all(e);
            }

            if self.is_idle() {
                match cmd_rx.recv().await {
                    Some(LoaderCommand::Cancel) | None => {
                        cancelled = true;
                        break 'main;
                    }
                    Some(cmd) => {
                        self.handle_command(cmd).await;
                        continue 'main;
                    }
                }
            }

            let Some((start, _)) = self.next_fetch_span() else {
                // Everything outstanding became satisfiable from cache.
                continue 'main;
            };

            let mut attempt: u32 = 0;
            'session: loop {
                let Some((session_start, session_end)) = self.next_fetch_span() else {
                    continue 'main;
                };
                match self
                    .run_session(&mut cmd_rx, session_start, session_end)
                    .await
                {
                    SessionEnd::Completed { delivered } => {
                        if delivered == 0 && self.next_fetch_span().map(|(s, _)| s) == Some(start)
                        {
                            self.fail_all(CacheError::Network(
                                "origin delivered no data for requested range".to_string(),
                            ));
                        }
                        continue 'main;
                    }
                    SessionEnd::Idle => continue 'main,
                    SessionEnd::Cancelled => {
                        cancelled = true;
                        break 'main;
                    }
                    SessionEnd::Failed(e) => {
                        if e.is_retriable() && attempt < self.ctx.retry.max_retries {
                            let delay = self.ctx.retry.delay_for(attempt);
                            attempt += 1;
                            debug!(
                                key = %self.key,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "retrying origin fetch"
                            );
                            if !self.sleep_with_commands(&mut cmd_rx, delay).await {
                                cancelled = true;
                                break 'main;
                            }
                            continue 'session;
                        }
                        self.fail_all(e);
                        continue 'main;
                    }
                }
            }
        }

        if cancelled {
            self.fail_all(CacheError::Cancelled);
        }
        debug!(key = %self.key, "loader stopped");
    }

    fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.preloads.is_empty()
    }

    fn release_one(&self) {
        self.attachments.fetch_sub(1, Ordering::SeqCst);
    }

    /// Handle any command except `Cancel` (callers intercept that)
    async fn handle_command(&mut self, cmd: LoaderCommand) {
        match cmd {
            LoaderCommand::Attach(request) => {
                if request.offset < 0 {
                    let _ = request.events.send(PlayerEvent::Failed(CacheError::Config(
                        format!("negative request offset {}", request.offset),
                    )));
                    self.release_one();
                    return;
                }
                self.requests.push(AttachedRequest {
                    next_offset: request.offset,
                    sent_info: false,
                    request,
                });
                if let Err(e) = self.service_from_cache().await {
                    warn!(key = %self.key, error = %e, "cache service failed");
                    self.fail_all(e);
                }
            }
            LoaderCommand::Detach(request_id) => {
                let before = self.requests.len();
                self.requests.retain(|a| a.request.id != request_id);
                for _ in self.requests.len()..before {
                    self.release_one();
                }
            }
            LoaderCommand::Preload {
                id,
                length,
                priority,
                done,
            } => {
                self.preload_priority = self.preload_priority.max(priority);
                self.preloads.push(PreloadAttachment {
                    id,
                    end: length.map(|l| l - 1),
                    done: Some(done),
                });
                if let Err(e) = self.service_from_cache().await {
                    warn!(key = %self.key, error = %e, "cache service failed");
                    self.fail_all(e);
                }
            }
            LoaderCommand::CancelPreload(preload_id) => {
                if let Some(pos) = self.preloads.iter().position(|p| p.id == preload_id) {
                    let mut preload = self.preloads.remove(pos);
                    if let Some(done) = preload.done.take() {
                        let _ = done.send(Err(CacheError::Cancelled));
                    }
                    self.release_one();
                }
            }
            LoaderCommand::Cancel => unreachable!("Cancel is intercepted by callers"),
        }
    }

    /// Serve what the cache already holds and retire satisfied attachments
    async fn service_from_cache(&mut self) -> Result<()> {
        if self.is_idle() {
            return Ok(());
        }

        // Commit buffered chunks so the range set reflects reality.
        self.ctx.core.flush_resource(&self.key).await?;
        let metadata = self.ctx.core.get_metadata(&self.key);
        let total = metadata.as_ref().and_then(|m| m.total_length);

        if let Some(info) = self.ctx.core.get_content_info(&self.key) {
            self.broadcast_info(&info);
        }

        if let Some(metadata) = &metadata {
            // Serve each request the contiguous cached run at its cursor.
            for att in &mut self.requests {
                loop {
                    let end = effective_end(att.request.end(), total);
                    if matches!(end, Some(e) if att.next_offset > e) {
                        break;
                    }
                    let missing = metadata.ranges.first_missing_at(att.next_offset);
                    if missing <= att.next_offset {
                        break;
                    }
                    let run_end = match end {
                        Some(e) => (missing - 1).min(e),
                        None => missing - 1,
                    };
                    if run_end < att.next_offset {
                        break;
                    }
                    let range = ByteRange::new(att.next_offset, run_end)?;
                    match self.ctx.core.read(&self.key, range).await? {
                        Some(data) => {
                            let sent = data.len() as i64;
                            let _ = att.request.events.send(PlayerEvent::Data(data));
                            att.next_offset += sent;
                        }
                        None => break, // raced with a removal; the session path recovers
                    }
                }
            }
        }

        self.retire_requests(total);
        self.retire_preloads(metadata.as_ref().map(|m| &m.ranges), total);
        Ok(())
    }

    /// Send `Finished` to every request whose span is fully delivered
    fn retire_requests(&mut self, total: Option<i64>) {
        let mut index = 0;
        while index < self.requests.len() {
            let att = &self.requests[index];
            let done = match effective_end(att.request.end(), total) {
                Some(end) => att.next_offset > end,
                None => false,
            };
            if done {
                let att = self.requests.remove(index);
                let _ = att.request.events.send(PlayerEvent::Finished);
                self.release_one();
            } else {
                index += 1;
            }
        }
    }

    /// Resolve preload attachments whose prefix is fully cached
    fn retire_preloads(&mut self, ranges: Option<&crate::ranges::RangeSet>, total: Option<i64>) {
        let Some(ranges) = ranges else { return };
        let covered_to = ranges.first_missing_at(0); // first uncovered offset
        let mut index = 0;
        while index < self.preloads.len() {
            let end = effective_end(self.preloads[index].end, total);
            let done = match end {
                Some(e) => covered_to > e,
                None => false, // unbounded preload resolves once the total is known
            };
            if done {
                let mut preload = self.preloads.remove(index);
                if let Some(done) = preload.done.take() {
                    let _ = done.send(Ok(()));
                }
                self.release_one();
            } else {
                index += 1;
            }
        }
    }

    /// First missing offset the attachments need, plus an inclusive end
    /// when every attachment is bounded
    ///
    /// Returns `None` when nothing needs the network.
    fn next_fetch_span(&self) -> Option<(i64, Option<i64>)> {
        let metadata = self.ctx.core.get_metadata(&self.key);
        let total = metadata.as_ref().and_then(|m| m.total_length);
        let empty = crate::ranges::RangeSet::new();
        let ranges = metadata.as_ref().map(|m| &m.ranges).unwrap_or(&empty);

        let mut start: Option<i64> = None;
        let mut end: Option<i64> = Some(i64::MIN);

        let mut consider = |cursor: i64, wanted_end: Option<i64>| {
            let missing = ranges.first_missing_at(cursor);
            if let Some(e) = wanted_end {
                if missing > e {
                    return; // already satisfiable from cache
                }
            }
            start = Some(start.map_or(missing, |s: i64| s.min(missing)));
            end = match (end, wanted_end) {
                (Some(acc), Some(e)) => Some(acc.max(e)),
                _ => None, // any unbounded attachment makes the fetch open-ended
            };
        };

        for att in &self.requests {
            let e = effective_end(att.request.end(), total);
            if matches!(e, Some(end) if att.next_offset > end) {
                continue;
            }
            consider(att.next_offset, e);
        }
        for preload in &self.preloads {
            consider(0, effective_end(preload.end, total));
        }

        start.map(|s| (s, end.filter(|e| *e != i64::MIN)))
    }

    /// One origin session: fetch from `start`, stream chunks into the
    /// cache and to overlapping requests
    async fn run_session(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<LoaderCommand>,
        start: i64,
        end: Option<i64>,
    ) -> SessionEnd {
        let remote = Arc::clone(&self.ctx.remote);
        let url = self.url.clone();
        let fetch = async move { remote.fetch(&url, Some(FetchRange { start, end })).await };
        tokio::pin!(fetch);

        // Commands stay live while the connection is being established.
        let response = loop {
            tokio::select! {
                result = &mut fetch => break result,
                cmd = cmd_rx.recv() => match cmd {
                    Some(LoaderCommand::Cancel) | None => return SessionEnd::Cancelled,
                    Some(cmd) => {
                        self.handle_command(cmd).await;
                        if self.is_idle() {
                            return SessionEnd::Idle;
                        }
                    }
                }
            }
        };
        let mut response = match response {
            Ok(r) => r,
            Err(e) => return SessionEnd::Failed(e),
        };

        // Learn content info exactly once per resource; the core enforces
        // fill-once semantics.
        let learned = ContentInfo {
            content_type: response.info.content_type.clone(),
            total_length: response.info.total_length,
            supports_range: response.info.supports_range,
        };
        if let Err(e) = self.ctx.core.update_content_info(&self.key, &learned).await {
            return SessionEnd::Failed(e);
        }
        if let Some(info) = self.ctx.core.get_content_info(&self.key) {
            self.broadcast_info(&info);
        }
        let total = self
            .ctx
            .core
            .get_metadata(&self.key)
            .and_then(|m| m.total_length);

        let mut offset = response.info.offset;
        let mut delivered: u64 = 0;

        loop {
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => match cmd {
                    Some(LoaderCommand::Cancel) | None => return SessionEnd::Cancelled,
                    Some(cmd) => {
                        self.handle_command(cmd).await;
                        // Nothing left attached: stop streaming, but still
                        // commit what arrived.
                        if self.is_idle() {
                            break;
                        }
                    }
                },
                chunk = response.body.next() => match chunk {
                    Some(Ok(mut chunk)) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        // Clamp an over-delivering origin at the declared total.
                        if let Some(t) = total {
                            if offset >= t {
                                break;
                            }
                            let room = (t - offset) as usize;
                            if chunk.len() > room {
                                chunk.truncate(room);
                            }
                        }

                        let len = chunk.len() as i64;
                        self.deliver_chunk(offset, &chunk, total);
                        if let Err(e) = self
                            .ctx
                            .core
                            .write(&self.key, offset, chunk, self.ctx.budget)
                            .await
                        {
                            return SessionEnd::Failed(e);
                        }
                        self.ctx.core.stats().record_fetched(len as u64);
                        offset += len;
                        delivered += len as u64;
                        self.retire_requests(total);
                        if self.is_idle() {
                            break;
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => break,
                }
            }
        }

        if let Err(e) = self.finalize_after_body(total).await {
            return SessionEnd::Failed(e);
        }
        SessionEnd::Completed { delivered }
    }

    /// Forward the overlapping part of a streamed chunk to every attached
    /// request, in offset order
    fn deliver_chunk(&mut self, offset: i64, chunk: &Bytes, total: Option<i64>) {
        let chunk_end = offset + chunk.len() as i64; // exclusive
        for att in &mut self.requests {
            let end = effective_end(att.request.end(), total);
            if matches!(end, Some(e) if att.next_offset > e) {
                continue;
            }
            if att.next_offset < offset || att.next_offset >= chunk_end {
                continue;
            }
            let from = (att.next_offset - offset) as usize;
            let to = match end {
                Some(e) => ((e + 1 - offset) as usize).min(chunk.len()),
                None => chunk.len(),
            };
            if from < to {
                let slice = chunk.slice(from..to);
                att.next_offset += slice.len() as i64;
                let _ = att.request.events.send(PlayerEvent::Data(slice));
            }
        }
    }

    /// Commit the tail, mark completion when coverage is total, scan HLS
    async fn finalize_after_body(&mut self, total: Option<i64>) -> Result<()> {
        self.ctx.core.flush_resource(&self.key).await?;

        if let Some(t) = total {
            let covers = self
                .ctx
                .core
                .get_metadata(&self.key)
                .map(|m| m.ranges.covers_exactly(t))
                .unwrap_or(false);
            if covers {
                if let Err(e) = self.ctx.core.mark_complete(&self.key, Some(t)).await {
                    warn!(key = %self.key, error = %e, "completion verification failed");
                }
            }
        }

        self.scan_playlist(total).await;
        Ok(())
    }

    /// If the cached body is an HLS playlist, enqueue its segments once
    async fn scan_playlist(&mut self, total: Option<i64>) {
        if self.hls_scanned {
            return;
        }
        let Some(sink) = self.ctx.segments.clone() else {
            return;
        };
        let Some(total) = total.filter(|t| *t > 0) else {
            return;
        };
        let is_playlist = self
            .ctx
            .core
            .get_metadata(&self.key)
            .and_then(|m| m.content_type)
            .map(|ct| hls::is_playlist_content_type(&ct))
            .unwrap_or(false);
        if !is_playlist {
            self.hls_scanned = true;
            return;
        }

        let range = match ByteRange::new(0, total - 1) {
            Ok(r) => r,
            Err(_) => return,
        };
        let Ok(Some(body)) = self.ctx.core.read(&self.key, range).await else {
            return; // playlist not fully cached yet; retry after the next session
        };
        self.hls_scanned = true;

        let text = String::from_utf8_lossy(&body);
        let urls = hls::segment_urls(&text, &self.url);
        debug!(key = %self.key, segments = urls.len(), "playlist scanned");
        for url in urls {
            let _ = sink.send(SegmentRequest {
                url,
                priority: self.preload_priority,
            });
        }
    }

    fn broadcast_info(&mut self, info: &ContentInfo) {
        for att in &mut self.requests {
            if att.request.wants_content_info && !att.sent_info {
                let _ = att.request.events.send(PlayerEvent::Info(info.clone()));
                att.sent_info = true;
            }
        }
    }

    /// Deliver a terminal failure to every attachment
    fn fail_all(&mut self, error: CacheError) {
        for att in self.requests.drain(..) {
            let _ = att.request.events.send(PlayerEvent::Failed(error.clone()));
            self.attachments.fetch_sub(1, Ordering::SeqCst);
        }
        for mut preload in self.preloads.drain(..) {
            if let Some(done) = preload.done.take() {
                let _ = done.send(Err(error.clone()));
            }
            self.attachments.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Backoff sleep that keeps serving commands; `false` means cancelled
    async fn sleep_with_commands(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<LoaderCommand>,
        delay: Duration,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = cmd_rx.recv() => match cmd {
                    Some(LoaderCommand::Cancel) | None => return false,
                    Some(cmd) => self.handle_command(cmd).await,
                }
            }
        }
    }
}
