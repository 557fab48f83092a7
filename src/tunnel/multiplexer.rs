//! Channel multiplexer for the control connection
//!
//! Keeps the channels open on one control connection, routes inbound
//! payloads and peer notifications to them by id, and carries their frames
//! out through the connection's [`FrameSink`].

use super::{ChannelOptions, TunnelChannel, TunnelError};
use crate::transport::{ChannelSession, FrameSink, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace, warn};

/// Channel registry for one control connection
pub struct Multiplexer<S> {
    sink: S,
    channels: Mutex<HashMap<u32, Arc<TunnelChannel>>>,
    options: ChannelOptions,
    me: Weak<Self>,
}

impl<S: FrameSink + 'static> Multiplexer<S> {
    /// Create a multiplexer emitting through `sink`; new channels use `options`
    pub fn new(sink: S, options: ChannelOptions) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            sink,
            channels: Mutex::new(HashMap::new()),
            options,
            me: me.clone(),
        })
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<u32, Arc<TunnelChannel>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The sink frames go out through
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Options applied to new channels
    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Register a channel the transport assigned `channel_id` to
    pub fn open_channel(&self, channel_id: u32) -> Result<Arc<TunnelChannel>, TunnelError> {
        let session: Weak<dyn ChannelSession> = self.me.clone();

        match self.channels().entry(channel_id) {
            Entry::Occupied(_) => Err(TunnelError::DuplicateChannel(channel_id)),
            Entry::Vacant(slot) => {
                let channel = TunnelChannel::open(channel_id, session, &self.options);
                slot.insert(channel.clone());
                Ok(channel)
            }
        }
    }

    /// Look up an open channel
    pub fn channel(&self, channel_id: u32) -> Option<Arc<TunnelChannel>> {
        self.channels().get(&channel_id).cloned()
    }

    /// Number of open channels
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    fn lookup(&self, channel_id: u32) -> Result<Arc<TunnelChannel>, TunnelError> {
        self.channel(channel_id)
            .ok_or(TunnelError::ChannelNotFound(channel_id))
    }

    /// Deliver an inbound payload to its channel
    pub fn receive(&self, channel_id: u32, payload: &[u8]) -> Result<(), TunnelError> {
        let channel = self.lookup(channel_id).map_err(|e| {
            trace!("Dropping {} bytes for unknown channel {}", payload.len(), channel_id);
            e
        })?;
        channel.receive(payload);
        Ok(())
    }

    /// The peer closed the channel gracefully
    pub fn notify_peer_closed(&self, channel_id: u32) -> Result<(), TunnelError> {
        self.lookup(channel_id)?.local_close();
        Ok(())
    }

    /// The transport failed for this channel
    pub fn notify_transport_failed(
        &self,
        channel_id: u32,
        cause: TransportError,
    ) -> Result<(), TunnelError> {
        self.lookup(channel_id)?.abort(cause);
        Ok(())
    }

    /// The peer's end of the proxied connection went away.
    ///
    /// With `error_indicator` set the channel is aborted, otherwise closed.
    pub fn notify_remote_end_closed(
        &self,
        channel_id: u32,
        error_indicator: bool,
    ) -> Result<(), TunnelError> {
        let channel = self.lookup(channel_id)?;
        debug!(
            "Channel {}: remote end closed ({})",
            channel_id,
            if error_indicator { "error" } else { "normal" }
        );

        if error_indicator {
            channel.abort(TransportError::RemoteError);
        } else {
            channel.local_close();
        }
        Ok(())
    }

    /// The control connection is gone: abort every channel
    pub fn notify_disconnected(&self, cause: TransportError) {
        let channels: Vec<_> = self.channels().drain().map(|(_, channel)| channel).collect();
        if channels.is_empty() {
            return;
        }

        warn!("Control connection lost, aborting {} channels: {}", channels.len(), cause);
        let cause = Arc::new(cause);
        for channel in channels {
            channel.abort(cause.clone());
        }
    }

    /// Close every channel, asking the peer to tear each one down
    pub async fn close_all(&self) {
        let channels: Vec<_> = self.channels().values().cloned().collect();
        for channel in channels {
            channel.close().await;
        }
    }
}

#[async_trait]
impl<S: FrameSink + 'static> ChannelSession for Multiplexer<S> {
    async fn send_frame(&self, channel_id: u32, payload: Bytes) -> Result<(), TransportError> {
        self.sink.send_frame(channel_id, payload).await
    }

    async fn request_channel_close(&self, channel_id: u32) {
        self.sink.request_channel_close(channel_id).await
    }

    fn release_channel(&self, channel_id: u32) {
        if self.channels().remove(&channel_id).is_some() {
            trace!("Channel {} deregistered", channel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{QueueSink, SinkEvent};
    use crate::tunnel::ChannelState;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<Multiplexer<QueueSink>>, mpsc::UnboundedReceiver<SinkEvent>) {
        let (sink, rx) = QueueSink::new();
        let options = ChannelOptions {
            size_threshold: 4,
            time_threshold: Duration::from_millis(100),
            receive_capacity: 8,
            ..ChannelOptions::default()
        };
        (Multiplexer::new(sink, options), rx)
    }

    #[test]
    fn test_open_channel() {
        let (mux, _rx) = setup();
        let channel = mux.open_channel(1).unwrap();

        assert_eq!(channel.id(), 1);
        assert_eq!(mux.channel_count(), 1);
        assert!(matches!(
            mux.open_channel(1),
            Err(TunnelError::DuplicateChannel(1))
        ));
    }

    #[tokio::test]
    async fn test_receive_routes_by_id() {
        let (mux, _rx) = setup();
        let a = mux.open_channel(1).unwrap();
        let b = mux.open_channel(2).unwrap();

        mux.receive(1, b"AB").unwrap();
        mux.receive(2, b"xy").unwrap();
        mux.receive(1, b"C").unwrap();

        let mut buf = [0u8; 8];
        let n = a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ABC");
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"xy");

        assert!(matches!(
            mux.receive(9, b"?"),
            Err(TunnelError::ChannelNotFound(9))
        ));
    }

    #[tokio::test]
    async fn test_frames_tagged_with_channel_id() {
        let (mux, mut rx) = setup();
        let channel = mux.open_channel(7).unwrap();

        channel.send(b"hello").await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(SinkEvent::Frame {
                channel_id: 7,
                payload: Bytes::from_static(b"hello"),
            })
        );
    }

    #[tokio::test]
    async fn test_peer_close_deregisters() {
        let (mux, _rx) = setup();
        let channel = mux.open_channel(3).unwrap();

        mux.notify_peer_closed(3).unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(mux.channel_count(), 0);
        assert_eq!(channel.read_byte().await.unwrap(), None);

        // Id can be reused once released
        assert!(mux.open_channel(3).is_ok());
    }

    #[tokio::test]
    async fn test_transport_failure_aborts() {
        let (mux, _rx) = setup();
        let channel = mux.open_channel(4).unwrap();

        mux.notify_transport_failed(4, TransportError::Disconnected)
            .unwrap();
        assert_eq!(channel.state(), ChannelState::Aborted);
        assert!(channel.read_byte().await.is_err());
        assert!(mux.channel(4).is_none());
    }

    #[tokio::test]
    async fn test_remote_end_closed() {
        let (mux, _rx) = setup();
        let normal = mux.open_channel(1).unwrap();
        let failed = mux.open_channel(2).unwrap();

        mux.notify_remote_end_closed(1, false).unwrap();
        mux.notify_remote_end_closed(2, true).unwrap();

        assert_eq!(normal.state(), ChannelState::Closed);
        assert_eq!(failed.state(), ChannelState::Aborted);
        assert_eq!(normal.read_byte().await.unwrap(), None);
        assert!(failed.read_byte().await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_aborts_all() {
        let (mux, _rx) = setup();
        let channels: Vec<_> = (1..=3).map(|id| mux.open_channel(id).unwrap()).collect();

        mux.notify_disconnected(TransportError::Disconnected);

        assert_eq!(mux.channel_count(), 0);
        for channel in channels {
            assert_eq!(channel.state(), ChannelState::Aborted);
            assert!(channel.send(b"x").await.is_err());
        }
    }

    #[tokio::test]
    async fn test_close_all_requests_teardown() {
        let (mux, mut rx) = setup();
        mux.open_channel(1).unwrap();
        mux.open_channel(2).unwrap();

        mux.close_all().await;
        assert_eq!(mux.channel_count(), 0);

        let mut closed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SinkEvent::CloseRequest { channel_id } = event {
                closed.push(channel_id);
            }
        }
        closed.sort();
        assert_eq!(closed, vec![1, 2]);
    }

    #[test]
    fn test_notify_unknown_channel() {
        let (mux, _rx) = setup();
        assert!(matches!(
            mux.notify_peer_closed(42),
            Err(TunnelError::ChannelNotFound(42))
        ));
    }
}
