//! # Proxy Tunnel
//!
//! Client-side proxy channels multiplexed over a single control connection.
//! Each channel carries one ordered byte stream (a shell, a device console,
//! any TCP-like conversation) to a managed endpoint without a direct network
//! path to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │        (send / read / close on TunnelChannel)        │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │   (write coalescing, inbound queue, channel state)   │
//! ├─────────────────────────────────────────────────────┤
//! │                Multiplexing Layer                    │
//! │        (channel registry, routing by channel id)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Control Connection                   │
//! │          (external: framing, auth, dispatch)         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Asynchronous outcomes (channel teardown, request expiry) are reported
//! through [`latch::CompletionLatch`].

pub mod config;
pub mod latch;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use latch::{CompletionLatch, LatchRegistry};
pub use transport::{ChannelSession, FrameSink, TransportError};
pub use tunnel::{ChannelOptions, ChannelState, Multiplexer, TunnelChannel, TunnelError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
