//! Duplex frame transport abstraction.
//!
//! The binder, sessions and dispatch only see [`FrameSink`] and
//! [`FrameSource`]. [`websocket`] adapts an axum `WebSocket`; [`memory`] is
//! an in-process pair used by tests.

pub mod memory;
pub mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// One transport-level frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload.
    Binary(Bytes),
    /// Liveness probe.
    Ping(Bytes),
    /// Liveness reply.
    Pong(Bytes),
    /// Close handshake.
    Close,
}

/// Failure reported by a transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport was closed by either side.
    #[error("transport closed")]
    Closed,
    /// The underlying stream failed.
    #[error("transport I/O error: {0}")]
    Io(String),
    /// A write did not complete in time.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the write half. Further writes fail with [`TransportError::Closed`].
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound frame, `None` once the peer is gone.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}
