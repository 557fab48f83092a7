//! One-shot completion latch
//!
//! A latch lets any number of tasks wait until an asynchronous outcome
//! arrives. It completes exactly once, either normally ([`CompletionLatch::signal`])
//! or by expiry ([`CompletionLatch::mark_expired`]). Latches never expire on
//! their own: a [`LatchRegistry`] sweep decides when an idle latch is dead.

mod reaper;

pub use reaper::LatchRegistry;

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default wait timeout (30 seconds)
pub const DEFAULT_LATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct LatchState {
    signaled: bool,
    expired: bool,
    last_activity: Instant,
    timeout: Duration,
}

/// One-shot, thread-safe completion flag
#[derive(Debug)]
pub struct CompletionLatch {
    state: Mutex<LatchState>,
    notify: Notify,
}

impl CompletionLatch {
    /// Create an unsignaled latch with the given wait timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LatchState {
                signaled: false,
                expired: false,
                last_activity: Instant::now(),
                timeout,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LatchState> {
        // Nothing inside the critical sections can panic half-way, so a
        // poisoned lock still holds consistent state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Complete the latch. Returns `true` if this call completed it.
    pub fn signal(&self) -> bool {
        {
            let mut state = self.lock();
            if state.signaled {
                return false;
            }
            state.signaled = true;
            state.last_activity = Instant::now();
        }
        self.notify.notify_waiters();
        true
    }

    /// Complete the latch as expired. Returns `false` (and leaves the latch
    /// untouched) if it had already completed.
    pub fn mark_expired(&self) -> bool {
        {
            let mut state = self.lock();
            if state.signaled {
                return false;
            }
            state.signaled = true;
            state.expired = true;
            state.last_activity = Instant::now();
        }
        self.notify.notify_waiters();
        true
    }

    /// Whether the latch has completed, normally or by expiry
    pub fn is_complete(&self) -> bool {
        self.lock().signaled
    }

    /// Whether the latch completed by expiry
    pub fn is_expired(&self) -> bool {
        self.lock().expired
    }

    /// Wait timeout used by [`wait_timeout`](Self::wait_timeout) and sweeps
    pub fn timeout(&self) -> Duration {
        self.lock().timeout
    }

    /// Change the wait timeout
    pub fn set_timeout(&self, timeout: Duration) {
        self.lock().timeout = timeout;
    }

    /// Time of creation or of the last [`touch`](Self::touch)/completion
    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    /// Record activity, postponing expiry by a sweep
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Whether an uncompleted latch has been idle longer than its timeout
    pub fn is_idle(&self, now: Instant) -> bool {
        let state = self.lock();
        !state.signaled && now.saturating_duration_since(state.last_activity) > state.timeout
    }

    /// Wait until the latch completes
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);

        loop {
            // Register interest before checking, so a signal between the
            // check and the await is not lost.
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Wait at most the latch's timeout. Returns `true` if it completed.
    pub async fn wait_timeout(&self) -> bool {
        let timeout = self.timeout();
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for CompletionLatch {
    fn default() -> Self {
        Self::new(DEFAULT_LATCH_TIMEOUT)
    }
}
