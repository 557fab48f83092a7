//! Inbound byte queue feeding a channel's read side
//!
//! The transport pushes payloads in with [`InboundQueue::write`]; readers
//! wait in [`InboundQueue::read`] until bytes arrive or the queue reaches a
//! terminal state. Buffered bytes are always delivered before the terminal
//! state is reported.

use super::TunnelError;
use crate::transport::TransportError;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

/// Terminal state of the queue
#[derive(Debug, Clone)]
enum QueueEnd {
    /// Still accepting data
    Open,
    /// Closed gracefully: end-of-stream after drain
    Closed,
    /// Faulted: error after drain. Overrides `Closed`.
    Faulted(Arc<TransportError>),
}

#[derive(Debug)]
struct Ring {
    buffer: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    end: QueueEnd,
}

impl Ring {
    fn unread(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Make room for `len` more bytes after `write_pos`
    fn reserve(&mut self, len: usize) {
        if self.buffer.len() - self.write_pos >= len {
            return;
        }

        let unread = self.unread();
        if self.buffer.len() - unread >= len {
            self.buffer.copy_within(self.read_pos..self.write_pos, 0);
        } else {
            let capacity = (self.buffer.len() * 2).max(unread + len);
            let mut grown = vec![0u8; capacity];
            grown[..unread].copy_from_slice(&self.buffer[self.read_pos..self.write_pos]);
            self.buffer = grown;
        }
        self.read_pos = 0;
        self.write_pos = unread;
    }

    /// Copy out buffered bytes, or report the terminal state when empty.
    /// `None` means the caller has to wait.
    fn take(&mut self, buf: &mut [u8]) -> Option<io::Result<usize>> {
        if self.read_pos < self.write_pos {
            let n = buf.len().min(self.unread());
            buf[..n].copy_from_slice(&self.buffer[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            if self.read_pos == self.write_pos {
                self.read_pos = 0;
                self.write_pos = 0;
            }
            return Some(Ok(n));
        }

        match &self.end {
            QueueEnd::Open => None,
            QueueEnd::Closed => Some(Ok(0)),
            QueueEnd::Faulted(cause) => Some(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                TunnelError::RemoteFault(cause.clone()),
            ))),
        }
    }
}

/// Growable ring buffer with waiting reads
#[derive(Debug)]
pub struct InboundQueue {
    ring: Mutex<Ring>,
    notify: Notify,
}

impl InboundQueue {
    /// Create a queue with the given initial capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                buffer: vec![0u8; capacity],
                read_pos: 0,
                write_pos: 0,
                end: QueueEnd::Open,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append bytes and wake readers.
    ///
    /// Data arriving after close or fault is discarded.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        {
            let mut ring = self.lock();
            if !matches!(ring.end, QueueEnd::Open) {
                trace!("Discarding {} bytes delivered to finished queue", data.len());
                return;
            }
            ring.reserve(data.len());
            let start = ring.write_pos;
            ring.buffer[start..start + data.len()].copy_from_slice(data);
            ring.write_pos += data.len();
        }
        self.notify.notify_waiters();
    }

    /// Read up to `buf.len()` bytes, waiting while the queue is empty.
    ///
    /// Returns `Ok(0)` at end-of-stream (or for an empty `buf`), and an
    /// error of kind `ConnectionAborted` wrapping the cause once a faulted
    /// queue has drained.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let notified = self.notify.notified();
        tokio::pin!(notified);

        loop {
            notified.as_mut().enable();
            if let Some(result) = self.lock().take(buf) {
                return result;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Read a single byte. `Ok(None)` at end-of-stream.
    pub async fn read_byte(&self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte).await? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Number of bytes readable without waiting
    pub fn available(&self) -> usize {
        self.lock().unread()
    }

    /// Current size of the backing buffer
    pub fn capacity(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Close gracefully: readers see end-of-stream once drained
    pub fn close(&self) {
        {
            let mut ring = self.lock();
            if matches!(ring.end, QueueEnd::Open) {
                ring.end = QueueEnd::Closed;
            }
        }
        self.notify.notify_waiters();
    }

    /// Record a sticky fault: readers get an error once drained.
    ///
    /// Takes priority over a previous close. The first fault wins.
    pub fn set_fault(&self, cause: Arc<TransportError>) {
        {
            let mut ring = self.lock();
            if !matches!(ring.end, QueueEnd::Faulted(_)) {
                ring.end = QueueEnd::Faulted(cause);
            }
        }
        self.notify.notify_waiters();
    }

    /// Whether the queue was closed or faulted
    pub fn is_finished(&self) -> bool {
        !matches!(self.lock().end, QueueEnd::Open)
    }

    /// The recorded fault, if any
    pub fn fault(&self) -> Option<Arc<TransportError>> {
        match &self.lock().end {
            QueueEnd::Faulted(cause) => Some(cause.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn read_all(queue: &InboundQueue, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = queue.read(&mut buf).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_read_in_order() {
        let queue = InboundQueue::new(16);
        queue.write(b"AB");
        queue.write(b"C");

        assert_eq!(queue.read_byte().await.unwrap(), Some(b'A'));
        assert_eq!(queue.read_byte().await.unwrap(), Some(b'B'));
        assert_eq!(queue.read_byte().await.unwrap(), Some(b'C'));
        assert_eq!(queue.available(), 0);
    }

    #[tokio::test]
    async fn test_read_byte_is_unsigned() {
        let queue = InboundQueue::new(4);
        queue.write(&[0xFF, 0x80]);

        assert_eq!(queue.read_byte().await.unwrap(), Some(255));
        assert_eq!(queue.read_byte().await.unwrap(), Some(128));
    }

    #[tokio::test]
    async fn test_chunking_invariance() {
        let payloads: Vec<Vec<u8>> = (0u8..20).map(|i| vec![i; (i as usize % 7) + 1]).collect();
        let expected: Vec<u8> = payloads.concat();

        for chunk in [1, 3, 8, 64] {
            let queue = InboundQueue::new(4);
            for payload in &payloads {
                queue.write(payload);
            }
            queue.close();
            assert_eq!(read_all(&queue, chunk).await, expected, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_cursors_reset_when_drained() {
        let queue = InboundQueue::new(8);
        queue.write(b"abcd");

        let mut buf = [0u8; 4];
        let mut ring = queue.lock();
        assert_eq!(ring.take(&mut buf).unwrap().unwrap(), 4);
        assert_eq!((ring.read_pos, ring.write_pos), (0, 0));
    }

    #[test]
    fn test_compaction_before_growth() {
        let queue = InboundQueue::new(8);
        queue.write(b"abcdef");
        {
            let mut buf = [0u8; 4];
            queue.lock().take(&mut buf).unwrap().unwrap();
        }

        // 2 unread + 5 new fits in 8 after compaction
        queue.write(b"ghijk");
        assert_eq!(queue.capacity(), 8);
        assert_eq!(queue.available(), 7);

        let ring = queue.lock();
        assert_eq!(&ring.buffer[..7], b"efghijk");
    }

    #[test]
    fn test_growth_doubles_or_fits() {
        let queue = InboundQueue::new(8);
        queue.write(b"abcdefg");
        queue.write(b"hij");
        assert_eq!(queue.capacity(), 16);

        queue.write(&[0u8; 40]);
        assert_eq!(queue.capacity(), 50);
        assert_eq!(queue.available(), 50);
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_write() {
        let queue = Arc::new(InboundQueue::new(8));

        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                let n = queue.read(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };

        tokio::task::yield_now().await;
        queue.write(b"hello");

        let data = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader not woken")
            .unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_close() {
        let queue = Arc::new(InboundQueue::new(8));

        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.read_byte().await.unwrap() })
        };

        tokio::task::yield_now().await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader not woken")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_fault() {
        let queue = Arc::new(InboundQueue::new(8));

        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.read_byte().await })
        };

        tokio::task::yield_now().await;
        queue.set_fault(Arc::new(TransportError::Disconnected));

        let err = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader not woken")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_fault_after_drain() {
        let queue = InboundQueue::new(8);
        queue.write(b"ok");
        queue.set_fault(Arc::new(TransportError::Disconnected));

        let mut buf = [0u8; 8];
        assert_eq!(queue.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ok");

        let err = queue.read(&mut buf).await.unwrap_err();
        let inner = err.get_ref().expect("fault carried as inner error");
        assert!(inner.to_string().contains("Control connection lost"));

        // Sticky
        assert!(queue.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_wins_over_close() {
        let queue = InboundQueue::new(8);
        queue.close();
        queue.set_fault(Arc::new(TransportError::RemoteError));

        assert!(queue.read_byte().await.is_err());
        assert!(queue.fault().is_some());
    }

    #[tokio::test]
    async fn test_write_after_close_is_discarded() {
        let queue = InboundQueue::new(8);
        queue.close();
        queue.write(b"late");

        assert_eq!(queue.available(), 0);
        assert_eq!(queue.read_byte().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_read_buffer() {
        let queue = InboundQueue::new(8);
        let mut buf = [0u8; 0];
        assert_eq!(queue.read(&mut buf).await.unwrap(), 0);
    }
}
