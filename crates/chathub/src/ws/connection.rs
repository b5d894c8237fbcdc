//! A single client connection bound to one room.
//!
//! Each connection owns a bounded outbound queue drained by exactly one
//! writer task, so concurrent broadcasts never interleave frames on a socket.
//! When the queue is full the oldest frame is discarded to make room: a slow
//! reader loses history instead of stalling the rest of its room.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use futures::Stream;
use log::{debug, warn};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::error::HubError;
use super::transport::{BoxFrameReader, BoxFrameWriter};
use super::types::{
    ConnectionId, ConnectionState, LeaveReason, RoomId, ServerEvent, UserId, UserIdentity,
};

/// Result of a successful [`Connection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The event was appended to the queue.
    Queued,
    /// The queue was full; its oldest event was discarded to admit this one.
    DroppedOldest,
}

struct SlowConsumerState {
    window: Duration,
    last_warning: Option<Instant>,
}

/// An open client connection.
pub struct Connection {
    id: ConnectionId,
    identity: UserIdentity,
    room_id: RoomId,
    capacity: usize,
    queue: Mutex<VecDeque<Arc<ServerEvent>>>,
    notify: Notify,
    slow_consumer: Mutex<SlowConsumerState>,
    dropped: AtomicU64,
    warnings: AtomicU64,
    state: AtomicU8,
    closed: AtomicBool,
    close_reason: OnceLock<LeaveReason>,
    cancel: CancellationToken,
    created_at: Instant,
    last_activity_ms: AtomicU64,
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    pub fn new(
        id: ConnectionId,
        identity: UserIdentity,
        room_id: RoomId,
        capacity: usize,
        slow_consumer_window: Duration,
    ) -> Self {
        Self {
            id,
            identity,
            room_id,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            slow_consumer: Mutex::new(SlowConsumerState {
                window: slow_consumer_window,
                last_warning: None,
            }),
            dropped: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            closed: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reason recorded by the first call to [`Connection::close_with`].
    pub fn close_reason(&self) -> Option<LeaveReason> {
        self.close_reason.get().copied()
    }

    /// Enqueue an event for asynchronous write.
    ///
    /// Never waits on the remote peer. A full queue discards its oldest event.
    pub fn send(&self, event: Arc<ServerEvent>) -> Result<SendOutcome, HubError> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed(self.id));
        }

        let outcome = {
            let mut queue = lock(&self.queue);
            let outcome = if queue.len() >= self.capacity {
                queue.pop_front();
                SendOutcome::DroppedOldest
            } else {
                SendOutcome::Queued
            };
            queue.push_back(event);
            outcome
        };
        self.notify.notify_one();

        if outcome == SendOutcome::DroppedOldest {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.record_slow_consumer();
        }

        Ok(outcome)
    }

    fn record_slow_consumer(&self) {
        let now = Instant::now();
        let mut state = lock(&self.slow_consumer);
        let window = state.window;
        let due = state
            .last_warning
            .is_none_or(|last| now.duration_since(last) >= window);
        if !due {
            return;
        }
        state.last_warning = Some(now);
        drop(state);

        self.warnings.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Slow consumer: connection {} ({}) in room {} is dropping queued messages ({} dropped so far)",
            self.id,
            self.identity.user_id,
            self.room_id,
            self.dropped.load(Ordering::Relaxed)
        );
    }

    /// Close the connection. Idempotent; returns true for the call that closed it.
    pub fn close(&self) -> bool {
        self.close_with(LeaveReason::PeerClosed)
    }

    /// Close the connection, recording why if it was still open.
    pub fn close_with(&self, reason: LeaveReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
        self.notify.notify_one();
        debug!("Connection {} closed ({})", self.id, reason);
        true
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Number of events waiting to be written.
    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Snapshot of the queued events, oldest first.
    pub fn queued(&self) -> Vec<Arc<ServerEvent>> {
        lock(&self.queue).iter().cloned().collect()
    }

    /// Events discarded by drop-oldest since the connection opened.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Slow-consumer warnings recorded (at most one per window).
    pub fn slow_consumer_warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    /// Mark inbound activity.
    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or since creation).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    /// Wait for the next queued event. `None` once the connection is closed;
    /// frames still queued at that point are not written.
    async fn next_outbound(&self) -> Option<Arc<ServerEvent>> {
        loop {
            if self.is_closed() {
                return None;
            }
            let next = lock(&self.queue).pop_front();
            if next.is_some() {
                return next;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("room_id", &self.room_id)
            .field("state", &self.state())
            .field("queued", &self.queue_len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drain a connection's queue into its transport until the connection closes.
///
/// This is the only writer for the connection. A failed write closes the
/// connection. The transport is released exactly once, when this returns.
pub async fn run_writer(
    conn: Arc<Connection>,
    mut writer: BoxFrameWriter,
    ping_interval: Option<Duration>,
) {
    let mut ping = ping_interval.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        let event = tokio::select! {
            biased;
            next = conn.next_outbound() => match next {
                Some(event) => event,
                None => break,
            },
            _ = tick(&mut ping) => Arc::new(ServerEvent::Ping),
        };

        let json = match serde_json::to_string(event.as_ref()) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize event for connection {}: {}", conn.id(), e);
                continue;
            }
        };

        // A peer that stopped reading must not hold the writer past close.
        let written = tokio::select! {
            biased;
            _ = conn.closed() => break,
            written = writer.write_frame(json) => written,
        };
        if let Err(e) = written {
            debug!("Write to connection {} failed: {}", conn.id(), e);
            conn.close_with(LeaveReason::TransportError);
            break;
        }
    }

    if let Err(e) = writer.close().await {
        debug!("Closing transport for connection {} failed: {}", conn.id(), e);
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// The inbound side of a connection: a lazy, finite sequence of text frames.
///
/// Ends when the peer closes, the transport fails, or the connection is
/// closed locally. [`InboundFrames::end_reason`] tells which.
pub struct InboundFrames {
    conn: Arc<Connection>,
    reader: BoxFrameReader,
    end: Option<LeaveReason>,
}

impl InboundFrames {
    pub fn new(conn: Arc<Connection>, reader: BoxFrameReader) -> Self {
        Self {
            conn,
            reader,
            end: None,
        }
    }

    /// Wait for the next frame.
    pub async fn next(&mut self) -> Option<String> {
        if self.end.is_some() {
            return None;
        }

        let result = tokio::select! {
            biased;
            _ = self.conn.closed() => {
                Err(self.conn.close_reason().unwrap_or(LeaveReason::ForcedDisconnect))
            }
            frame = self.reader.read_frame() => match frame {
                Some(Ok(text)) => Ok(text),
                Some(Err(e)) => {
                    debug!("Read from connection {} failed: {}", self.conn.id(), e);
                    Err(LeaveReason::TransportError)
                }
                None => Err(LeaveReason::PeerClosed),
            },
        };

        match result {
            Ok(text) => Some(text),
            Err(reason) => {
                self.end = Some(reason);
                None
            }
        }
    }

    /// Why the sequence ended. `None` while it is still open.
    pub fn end_reason(&self) -> Option<LeaveReason> {
        self.end
    }

    /// Adapt into a `Stream` of frames.
    pub fn into_stream(self) -> impl Stream<Item = String> + Send + 'static {
        futures::stream::unfold(self, |mut frames| async move {
            frames.next().await.map(|frame| (frame, frames))
        })
    }
}
