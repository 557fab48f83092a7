//! Outbound coalescing buffer
//!
//! Small writes accumulate in a preallocated buffer until either the size
//! threshold would be reached (flush immediately, together with the write
//! that crossed it) or the time threshold elapses (the channel's flush timer
//! takes whatever is pending). This module only holds the buffer state;
//! locking and timers belong to the channel.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

/// Outcome of pushing a write into the buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Push {
    /// Zero-length write, nothing to do
    Empty,
    /// Bytes were buffered. `arm_timer` is set on the first pending byte.
    Buffered { arm_timer: bool },
    /// Size threshold reached: emit this payload as one frame
    Flush(Bytes),
}

/// Size/time bounded write coalescer
#[derive(Debug)]
pub struct OutboundBuffer {
    buffer: Vec<u8>,
    pending: usize,
    time_threshold: Duration,
}

impl OutboundBuffer {
    /// Create a buffer holding up to `size_threshold` bytes
    pub fn new(size_threshold: usize, time_threshold: Duration) -> Self {
        Self {
            buffer: vec![0u8; size_threshold],
            pending: 0,
            time_threshold,
        }
    }

    /// Buffer `data`, or produce the frame payload once the threshold is hit
    pub fn push(&mut self, data: &[u8]) -> Push {
        if data.is_empty() {
            return Push::Empty;
        }

        let total = self.pending + data.len();
        if total < self.buffer.len() {
            self.buffer[self.pending..total].copy_from_slice(data);
            let arm_timer = self.pending == 0;
            self.pending = total;
            return Push::Buffered { arm_timer };
        }

        let payload = if total <= self.buffer.len() {
            self.buffer[self.pending..total].copy_from_slice(data);
            Bytes::copy_from_slice(&self.buffer[..total])
        } else {
            let mut payload = BytesMut::with_capacity(total);
            payload.put_slice(&self.buffer[..self.pending]);
            payload.put_slice(data);
            payload.freeze()
        };
        self.pending = 0;
        Push::Flush(payload)
    }

    /// Take the pending prefix, if any
    pub fn take_pending(&mut self) -> Option<Bytes> {
        if self.pending == 0 {
            return None;
        }
        let payload = Bytes::copy_from_slice(&self.buffer[..self.pending]);
        self.pending = 0;
        Some(payload)
    }

    /// Replace the buffer with a fresh one. Returns the number of pending
    /// bytes dropped.
    pub fn reconfigure(&mut self, size_threshold: usize, time_threshold: Duration) -> usize {
        let dropped = self.pending;
        self.buffer = vec![0u8; size_threshold];
        self.pending = 0;
        self.time_threshold = time_threshold;
        dropped
    }

    /// Bytes waiting for a flush
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Size threshold
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Time threshold
    pub fn time_threshold(&self) -> Duration {
        self.time_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(size: usize) -> OutboundBuffer {
        OutboundBuffer::new(size, Duration::from_millis(100))
    }

    #[test]
    fn test_small_writes_coalesce() {
        let mut out = buffer(16);
        assert_eq!(out.push(b"ab"), Push::Buffered { arm_timer: true });
        assert_eq!(out.push(b"cd"), Push::Buffered { arm_timer: false });
        assert_eq!(out.pending(), 4);

        assert_eq!(out.take_pending(), Some(Bytes::from_static(b"abcd")));
        assert_eq!(out.pending(), 0);
        assert_eq!(out.take_pending(), None);
    }

    #[test]
    fn test_overflow_flushes_pending_and_new() {
        let mut out = buffer(4);
        assert_eq!(out.push(&[1, 2]), Push::Buffered { arm_timer: true });
        assert_eq!(
            out.push(&[3, 4, 5]),
            Push::Flush(Bytes::from_static(&[1, 2, 3, 4, 5]))
        );
        assert_eq!(out.pending(), 0);
        assert_eq!(out.take_pending(), None);
    }

    #[test]
    fn test_reaching_threshold_exactly_flushes() {
        let mut out = buffer(4);
        out.push(&[1]);
        assert_eq!(
            out.push(&[2, 3, 4]),
            Push::Flush(Bytes::from_static(&[1, 2, 3, 4]))
        );
    }

    #[test]
    fn test_oversize_write_alone() {
        let mut out = buffer(4);
        let big = vec![9u8; 10];
        assert_eq!(out.push(&big), Push::Flush(Bytes::from(big.clone())));
        assert_eq!(out.capacity(), 4);
    }

    #[test]
    fn test_empty_write() {
        let mut out = buffer(4);
        assert_eq!(out.push(&[]), Push::Empty);
        assert_eq!(out.pending(), 0);
    }

    #[test]
    fn test_rearm_after_flush() {
        let mut out = buffer(4);
        out.push(&[1, 2, 3, 4]);
        assert_eq!(out.push(&[5]), Push::Buffered { arm_timer: true });
    }

    #[test]
    fn test_reconfigure_drops_pending() {
        let mut out = buffer(8);
        out.push(b"abc");

        let dropped = out.reconfigure(2, Duration::from_millis(5));
        assert_eq!(dropped, 3);
        assert_eq!(out.pending(), 0);
        assert_eq!(out.capacity(), 2);
        assert_eq!(out.time_threshold(), Duration::from_millis(5));

        assert_eq!(out.push(b"x"), Push::Buffered { arm_timer: true });
        assert_eq!(out.push(b"y"), Push::Flush(Bytes::from_static(b"xy")));
    }
}
