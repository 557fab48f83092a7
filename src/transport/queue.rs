//! In-process frame sink backed by an unbounded queue

use super::{FrameSink, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Event emitted by a [`QueueSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// A data frame for a channel
    Frame { channel_id: u32, payload: Bytes },
    /// A teardown request for a channel
    CloseRequest { channel_id: u32 },
}

/// Frame sink that pushes every frame and close request onto a queue
///
/// Whoever holds the receiver plays the remote peer. Sends can be switched
/// to fail, which is how flush failures are injected.
pub struct QueueSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
    failing: AtomicBool,
}

impl QueueSink {
    /// Create a sink and the receiver observing its events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                failing: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Make subsequent `send_frame` calls fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl FrameSink for QueueSink {
    async fn send_frame(&self, channel_id: u32, payload: Bytes) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed(format!(
                "frame for channel {} rejected",
                channel_id
            )));
        }
        self.tx
            .send(SinkEvent::Frame {
                channel_id,
                payload,
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn request_channel_close(&self, channel_id: u32) {
        let _ = self.tx.send(SinkEvent::CloseRequest { channel_id });
    }
}
