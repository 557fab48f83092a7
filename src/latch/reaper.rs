//! Sweep of outstanding latches

use super::CompletionLatch;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Outstanding latches keyed by request
///
/// A sweep marks every latch idle past its timeout as expired, which wakes
/// its waiters, and forgets latches that already completed.
pub struct LatchRegistry<K> {
    latches: Mutex<HashMap<K, Arc<CompletionLatch>>>,
}

impl<K> LatchRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            latches: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Arc<CompletionLatch>>> {
        self.latches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a latch, replacing any previous latch under the same key
    pub fn register(&self, key: K, latch: Arc<CompletionLatch>) -> Option<Arc<CompletionLatch>> {
        self.lock().insert(key, latch)
    }

    /// Stop tracking a latch
    pub fn remove(&self, key: &K) -> Option<Arc<CompletionLatch>> {
        self.lock().remove(key)
    }

    /// Look up a tracked latch
    pub fn get(&self, key: &K) -> Option<Arc<CompletionLatch>> {
        self.lock().get(key).cloned()
    }

    /// Number of tracked latches
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no latches are tracked
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Expire idle latches and drop completed ones. Returns the expired keys.
    pub fn sweep(&self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();

        self.lock().retain(|key, latch| {
            if latch.is_idle(now) && latch.mark_expired() {
                debug!("Latch {:?} expired after {:?}", key, latch.timeout());
                expired.push(key.clone());
                return false;
            }
            !latch.is_complete()
        });

        expired
    }

    /// Sweep every `interval` on the current runtime.
    ///
    /// The task holds only a weak reference and ends once the registry is
    /// dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(live) = registry.upgrade() else {
                    trace!("Latch registry dropped, reaper exiting");
                    return;
                };
                live.sweep(Instant::now());
            }
        })
    }
}

impl<K> Default for LatchRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
