//! Transport seam between tunnel channels and the control connection
//!
//! The control connection itself (framing, authentication, message
//! dispatch) lives outside this crate. Channels only need two things from it:
//! - emit one framed payload tagged with a channel id
//! - ask the peer to tear a channel down
//!
//! [`FrameSink`] is that outer interface. [`ChannelSession`] is what a
//! channel holds a weak reference to; the multiplexer implements it on top
//! of a sink.

mod queue;

pub use queue::{QueueSink, SinkEvent};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Control connection lost")]
    Disconnected,

    #[error("Remote end closed with error")]
    RemoteError,

    #[error("Connection closed")]
    Closed,
}

/// Outbound half of the control connection, as seen by the tunnel layer
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Emit one framed payload for `channel_id` on the control connection
    async fn send_frame(&self, channel_id: u32, payload: Bytes) -> Result<(), TransportError>;

    /// Ask the peer to tear `channel_id` down. Fire and forget.
    async fn request_channel_close(&self, channel_id: u32);
}

/// Back-reference a channel keeps to the session that owns its id
#[async_trait]
pub trait ChannelSession: Send + Sync {
    /// Emit a data frame for the channel
    async fn send_frame(&self, channel_id: u32, payload: Bytes) -> Result<(), TransportError>;

    /// Request remote teardown of the channel
    async fn request_channel_close(&self, channel_id: u32);

    /// Called once when the channel releases its session reference
    fn release_channel(&self, channel_id: u32);
}
