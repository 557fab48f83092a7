//! Tunnel layer - proxy channels over the control connection
//!
//! Provides:
//! - Outbound write coalescing with size and time thresholds
//! - Inbound byte queue with waiting reads
//! - Channel lifecycle (open, closed, aborted)
//! - Channel multiplexing by id

mod channel;
mod inbound;
mod multiplexer;
mod outbound;

pub use channel::{ChannelState, TunnelChannel};
pub use inbound::InboundQueue;
pub use multiplexer::Multiplexer;
pub use outbound::{OutboundBuffer, Push};

use crate::latch::DEFAULT_LATCH_TIMEOUT;
use crate::transport::TransportError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    #[error("Channel {0} is not open")]
    NotOpen(u32),

    #[error("Flush failed: {0}")]
    FlushFailure(Arc<TransportError>),

    #[error("Remote fault: {0}")]
    RemoteFault(Arc<TransportError>),

    #[error("Channel not found: {0}")]
    ChannelNotFound(u32),

    #[error("Channel already open: {0}")]
    DuplicateChannel(u32),
}

/// Default size threshold for write coalescing (8 KB)
pub const DEFAULT_SIZE_THRESHOLD: usize = 8192;

/// Default time threshold for write coalescing
pub const DEFAULT_TIME_THRESHOLD: Duration = Duration::from_millis(100);

/// Default initial capacity of the inbound queue (64 KB)
pub const DEFAULT_RECEIVE_CAPACITY: usize = 65536;

/// Buffering parameters applied when a channel is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Coalesced bytes that force an immediate flush
    pub size_threshold: usize,
    /// Longest time a buffered byte waits before it is flushed
    pub time_threshold: Duration,
    /// Initial inbound queue capacity
    pub receive_capacity: usize,
    /// Time without traffic after which a sweep may expire the channel's
    /// teardown latch
    pub idle_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            time_threshold: DEFAULT_TIME_THRESHOLD,
            receive_capacity: DEFAULT_RECEIVE_CAPACITY,
            idle_timeout: DEFAULT_LATCH_TIMEOUT,
        }
    }
}
