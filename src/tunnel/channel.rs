//! Tunnel channel: one ordered byte stream carried over the control connection
//!
//! A channel pairs an [`OutboundBuffer`] (coalesced sends) with an
//! [`InboundQueue`] (waiting reads) under one channel id, and keeps a weak
//! reference to the session that carries its frames. The two halves are
//! locked independently so sending never waits on receiving.

use super::inbound::InboundQueue;
use super::outbound::{OutboundBuffer, Push};
use super::{ChannelOptions, TunnelError};
use crate::latch::CompletionLatch;
use crate::transport::{ChannelSession, TransportError};
use bytes::Bytes;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Frames flow both ways
    Open,
    /// Closed gracefully, by either side
    Closed,
    /// Torn down by a transport failure or a peer error
    Aborted,
}

struct Link {
    state: ChannelState,
    session: Option<Weak<dyn ChannelSession>>,
}

/// The armed flush timer.
///
/// Dropping `cancel` stops the timer task only while it sleeps. Once the
/// delay has elapsed the task no longer listens, so a flush that started
/// always finishes its frame. `generation` moves on every arm and cancel;
/// a fired timer whose generation is stale does nothing.
#[derive(Default)]
struct FlushTimer {
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
}

/// A multiplexed proxy channel
pub struct TunnelChannel {
    id: u32,
    link: Mutex<Link>,
    /// Held across frame emission so a send and a timer flush never interleave
    outbound: tokio::sync::Mutex<OutboundBuffer>,
    flush_timer: Mutex<FlushTimer>,
    flush_error: Mutex<Option<TunnelError>>,
    inbound: InboundQueue,
    closed: Arc<CompletionLatch>,
    me: Weak<TunnelChannel>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl TunnelChannel {
    /// Open a channel whose frames go through `session`.
    ///
    /// No timer runs until the first buffered write.
    pub fn open(id: u32, session: Weak<dyn ChannelSession>, options: &ChannelOptions) -> Arc<Self> {
        debug!(
            "Channel {} opened (size threshold {}, time threshold {:?})",
            id, options.size_threshold, options.time_threshold
        );

        Arc::new_cyclic(|me| Self {
            id,
            link: Mutex::new(Link {
                state: ChannelState::Open,
                session: Some(session),
            }),
            outbound: tokio::sync::Mutex::new(OutboundBuffer::new(
                options.size_threshold,
                options.time_threshold,
            )),
            flush_timer: Mutex::new(FlushTimer::default()),
            flush_error: Mutex::new(None),
            inbound: InboundQueue::new(options.receive_capacity),
            closed: Arc::new(CompletionLatch::new(options.idle_timeout)),
            me: me.clone(),
        })
    }

    /// Channel id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        lock(&self.link).state
    }

    /// Whether the session reference has been released
    pub fn is_closed(&self) -> bool {
        lock(&self.link).session.is_none()
    }

    /// Last flush failure. Once set, every further send fails with it.
    pub fn flush_error(&self) -> Option<TunnelError> {
        lock(&self.flush_error).clone()
    }

    fn session(&self) -> Option<Arc<dyn ChannelSession>> {
        lock(&self.link).session.as_ref().and_then(Weak::upgrade)
    }

    fn check_writable(&self) -> Result<(), TunnelError> {
        if self.state() != ChannelState::Open {
            return Err(TunnelError::NotOpen(self.id));
        }
        match self.flush_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Send bytes to the peer.
    ///
    /// Small writes are buffered and go out together when the size threshold
    /// is reached or the time threshold elapses, whichever comes first.
    pub async fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        self.check_writable()?;

        let mut outbound = self.outbound.lock().await;
        self.check_writable()?;
        self.closed.touch();

        match outbound.push(data) {
            Push::Empty => Ok(()),
            Push::Buffered { arm_timer } => {
                if arm_timer {
                    self.arm_flush_timer(outbound.time_threshold());
                }
                Ok(())
            }
            Push::Flush(payload) => {
                self.cancel_flush_timer();
                self.emit(payload).await
            }
        }
    }

    /// Emit pending bytes now instead of waiting for the timer
    pub async fn flush(&self) -> Result<(), TunnelError> {
        let mut outbound = self.outbound.lock().await;
        self.check_writable()?;

        self.cancel_flush_timer();
        match outbound.take_pending() {
            Some(payload) => self.emit(payload).await,
            None => Ok(()),
        }
    }

    /// Replace the outbound buffer. Pending bytes are dropped.
    pub async fn set_buffering_thresholds(&self, size_threshold: usize, time_threshold: Duration) {
        let mut outbound = self.outbound.lock().await;
        self.cancel_flush_timer();

        let dropped = outbound.reconfigure(size_threshold, time_threshold);
        if dropped > 0 {
            debug!(
                "Channel {}: dropped {} pending bytes on buffer reconfiguration",
                self.id, dropped
            );
        }
    }

    /// Emit one frame. Must be called with the outbound lock held.
    async fn emit(&self, payload: Bytes) -> Result<(), TunnelError> {
        let session = self.session().ok_or(TunnelError::NotOpen(self.id))?;

        trace!("Channel {}: emitting {} bytes", self.id, payload.len());
        session.send_frame(self.id, payload).await.map_err(|e| {
            let err = TunnelError::FlushFailure(Arc::new(e));
            *lock(&self.flush_error) = Some(err.clone());
            err
        })
    }

    fn arm_flush_timer(&self, delay: Duration) {
        let (cancel, cancelled) = oneshot::channel::<()>();
        let generation = {
            let mut timer = lock(&self.flush_timer);
            timer.generation += 1;
            // Replacing the sender stops the previous timer if it still sleeps
            timer.cancel = Some(cancel);
            timer.generation
        };

        let channel = self.me.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled => return,
            }
            if let Some(channel) = channel.upgrade() {
                channel.flush_on_timer(generation).await;
            }
        });
    }

    fn cancel_flush_timer(&self) {
        let mut timer = lock(&self.flush_timer);
        timer.generation += 1;
        timer.cancel = None;
    }

    async fn flush_on_timer(&self, generation: u64) {
        let mut outbound = self.outbound.lock().await;
        if lock(&self.flush_timer).generation != generation {
            trace!("Channel {}: superseded flush timer ignored", self.id);
            return;
        }
        if self.state() != ChannelState::Open {
            return;
        }
        let Some(payload) = outbound.take_pending() else {
            return;
        };

        // Nobody is waiting on this flush; the error is kept for the next send.
        if let Err(err) = self.emit(payload).await {
            warn!("Channel {}: deferred flush failed: {}", self.id, err);
        }
    }

    /// Deliver an inbound payload from the transport
    pub fn receive(&self, payload: &[u8]) {
        trace!("Channel {}: received {} bytes", self.id, payload.len());
        self.closed.touch();
        self.inbound.write(payload);
    }

    /// Read up to `buf.len()` bytes, waiting for data. `Ok(0)` at end-of-stream.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inbound.read(buf).await
    }

    /// Read one byte, waiting for data. `Ok(None)` at end-of-stream.
    pub async fn read_byte(&self) -> io::Result<Option<u8>> {
        self.inbound.read_byte().await
    }

    /// Bytes readable without waiting
    pub fn available(&self) -> usize {
        self.inbound.available()
    }

    /// Flush pending bytes, ask the peer to tear the channel down, then
    /// close locally. Idempotent.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.flush().await {
            debug!("Channel {}: pending bytes lost on close: {}", self.id, err);
        }
        if let Some(session) = self.session() {
            session.request_channel_close(self.id).await;
        }
        self.local_close();
    }

    /// Close without notifying the peer, e.g. because the peer closed first.
    ///
    /// A timer flush already under way still completes its frame. Readers see
    /// end-of-stream once drained; sends fail with `NotOpen`.
    pub fn local_close(&self) {
        self.cancel_flush_timer();
        self.inbound.close();

        let session = {
            let mut link = lock(&self.link);
            if link.state == ChannelState::Open {
                link.state = ChannelState::Closed;
            }
            link.session.take()
        };
        if session.is_some() {
            debug!("Channel {} closed", self.id);
        }
        self.release(session);
    }

    /// Tear the channel down after a transport failure.
    ///
    /// Readers get an error wrapping `cause` once drained, even if the channel
    /// was already closed gracefully.
    pub fn abort(&self, cause: impl Into<Arc<TransportError>>) {
        let cause = cause.into();
        self.inbound.set_fault(cause.clone());
        self.cancel_flush_timer();

        let session = {
            let mut link = lock(&self.link);
            link.state = ChannelState::Aborted;
            link.session.take()
        };
        if session.is_some() {
            debug!("Channel {} aborted: {}", self.id, cause);
        }
        self.release(session);
    }

    fn release(&self, session: Option<Weak<dyn ChannelSession>>) {
        if let Some(session) = session.as_ref().and_then(Weak::upgrade) {
            session.release_channel(self.id);
        }
        self.closed.signal();
    }

    /// Wait until the channel is closed or aborted, or a sweep expired its
    /// teardown latch after a quiet period
    pub async fn wait_closed(&self) {
        self.closed.wait().await
    }

    /// Latch completed when the channel leaves the open state.
    ///
    /// Sends and received payloads count as activity, so a
    /// [`LatchRegistry`](crate::latch::LatchRegistry) sweep expires it only
    /// after `idle_timeout` without traffic.
    pub fn closed_latch(&self) -> Arc<CompletionLatch> {
        self.closed.clone()
    }
}

impl std::fmt::Debug for TunnelChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelChannel")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("available", &self.available())
            .finish()
    }
}
