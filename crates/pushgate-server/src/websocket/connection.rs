//! Live connection state: owner, event subscriptions, serialized writer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::ids::{ConnectionId, Identity};
use crate::transport::{Frame, FrameSink, TransportError};

/// Upper bound on how long `close` waits for the writer.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Wildcard event name meaning "every event".
pub const ALL_EVENTS: &str = "*";

/// One open client connection.
///
/// Writes go through an async mutex so at most one frame is in flight and
/// frames from sequential callers reach the wire in call order.
pub struct EventConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Identity this connection was opened for.
    pub owner: Identity,
    events: RwLock<HashSet<String>>,
    writer: tokio::sync::Mutex<Box<dyn FrameSink>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has shown activity since the last heartbeat tick.
    pub is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    closed: AtomicBool,
    close_signal: CancellationToken,
}

impl EventConnection {
    /// Create a connection around a transport write half.
    pub fn new(
        id: ConnectionId,
        owner: Identity,
        events: impl IntoIterator<Item = String>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            owner,
            events: RwLock::new(events.into_iter().collect()),
            writer: tokio::sync::Mutex::new(sink),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            closed: AtomicBool::new(false),
            close_signal: CancellationToken::new(),
        }
    }

    /// Write one text frame.
    pub async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send_frame(Frame::Text(text.to_owned())).await
    }

    /// Write a heartbeat ping.
    pub async fn send_ping(&self) -> Result<(), TransportError> {
        self.send_frame(Frame::Ping(Bytes::new())).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.send_frame(frame).await
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Wakes anyone waiting on [`closed`](Self::closed), then closes the
    /// sink. A writer stuck behind a stalled write is abandoned after a
    /// short timeout.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_signal.cancel();
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(conn_id = %self.id, error = %e, "close failed"),
            Err(_) => tracing::debug!(conn_id = %self.id, "close timed out"),
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.close_signal.cancelled().await;
    }

    /// Current subscriptions, sorted.
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.events.read().iter().cloned().collect();
        events.sort();
        events
    }

    /// Whether a message scoped to `event` should reach this connection.
    ///
    /// `None`, `""` and `"*"` address every connection. A connection with no
    /// subscriptions, or subscribed to `"*"`, receives every event.
    pub fn wants(&self, event: Option<&str>) -> bool {
        let Some(event) = event.filter(|e| !e.is_empty() && *e != ALL_EVENTS) else {
            return true;
        };
        let events = self.events.read();
        events.is_empty() || events.contains(ALL_EVENTS) || events.contains(event)
    }

    /// Add subscriptions. Blank names are ignored.
    pub fn subscribe<I, S>(&self, events: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = self.events.write();
        for event in events {
            let event = event.as_ref().trim();
            if !event.is_empty() {
                let _ = set.insert(event.to_owned());
            }
        }
    }

    /// Remove subscriptions.
    pub fn unsubscribe<I, S>(&self, events: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = self.events.write();
        for event in events {
            let _ = set.remove(event.as_ref().trim());
        }
    }

    /// Mark the connection as alive (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for EventConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConnection")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("events", &self.events())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
