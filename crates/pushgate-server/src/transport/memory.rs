//! In-memory transport for tests and embedding.
//!
//! [`pair`] returns the server-side halves plus a [`MemoryPeer`] that plays
//! the remote client: it reads what the server wrote, feeds inbound frames,
//! and can make writes fail or stall.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Frame, FrameSink, FrameSource, TransportError};

/// Server-side write half.
pub struct MemorySink {
    outbound: mpsc::UnboundedSender<Frame>,
    faults: Arc<Faults>,
    closed: bool,
}

/// Server-side read half.
pub struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

/// The remote end of a memory transport.
pub struct MemoryPeer {
    outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    faults: Arc<Faults>,
}

#[derive(Default)]
struct Faults {
    fail_writes: AtomicBool,
    stall_writes: AtomicBool,
}

/// Create a connected sink/source/peer triple.
pub fn pair() -> (MemorySink, MemorySource, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let faults = Arc::new(Faults::default());
    (
        MemorySink {
            outbound: out_tx,
            faults: faults.clone(),
            closed: false,
        },
        MemorySource { inbound: in_rx },
        MemoryPeer {
            outbound: out_rx,
            inbound: Some(in_tx),
            faults,
        },
    )
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.faults.stall_writes.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        if self.faults.fail_writes.load(Ordering::Relaxed) {
            return Err(TransportError::Io("broken pipe".into()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The peer may already be gone; closing is still successful.
        let _ = self.outbound.send(Frame::Close);
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await
    }
}

impl MemoryPeer {
    /// Feed a text frame to the server.
    pub fn send_text(&self, text: impl Into<String>) {
        self.send_frame(Frame::Text(text.into()));
    }

    /// Feed any frame to the server.
    pub fn send_frame(&self, frame: Frame) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Ok(frame));
        }
    }

    /// Make the server's next read fail.
    pub fn inject_read_error(&self, message: &str) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Err(TransportError::Io(message.to_owned())));
        }
    }

    /// End the inbound stream, as if the client vanished.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Make every subsequent server write fail.
    pub fn break_writes(&self) {
        self.faults.fail_writes.store(true, Ordering::Relaxed);
    }

    /// Make every subsequent server write hang forever.
    pub fn stall_writes(&self) {
        self.faults.stall_writes.store(true, Ordering::Relaxed);
    }

    /// Next frame the server wrote, waiting for it.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Next frame the server wrote, if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }

    /// Next text frame the server wrote, skipping control frames.
    ///
    /// Returns `None` once the server closes or drops the sink.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.outbound.recv().await? {
                Frame::Text(text) => return Some(text),
                Frame::Close => return None,
                Frame::Binary(_) | Frame::Ping(_) | Frame::Pong(_) => {}
            }
        }
    }

    /// Drain every queued text frame.
    pub fn drain_texts(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            if let Frame::Text(text) = frame {
                texts.push(text);
            }
        }
        texts
    }
}
