//! Permit limiter — counting admission control for workflow steps and the
//! network calls they fan into.
//!
//! A [`Limiter`] hands out up to `capacity` permits; callers over the limit
//! queue FIFO. The [`LimiterRegistry`] keys limiters by resource name so
//! unrelated components can compete for the same budget ("all steps that
//! talk to this backend share four slots").

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::CoreError;

enum WaitOutcome {
    Granted,
    Drained,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<WaitOutcome>,
}

struct LimiterState {
    available: usize,
    queue: VecDeque<Waiter>,
    next_waiter: u64,
}

struct LimiterInner {
    capacity: usize,
    state: Mutex<LimiterState>,
}

/// A counting permit limiter with a FIFO waiter queue.
///
/// Cheap to clone; all clones share the same permit pool.
#[derive(Clone)]
pub struct Limiter {
    inner: Arc<LimiterInner>,
}

impl Limiter {
    /// Create a limiter with a fixed capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "limiter capacity must be at least 1");
        Self {
            inner: Arc::new(LimiterInner {
                capacity,
                state: Mutex::new(LimiterState {
                    available: capacity,
                    queue: VecDeque::new(),
                    next_waiter: 0,
                }),
            }),
        }
    }

    // The mutex only guards counter/queue updates and is never held across
    // an await; a poisoned lock still holds consistent state, so recover it.
    fn state(&self) -> MutexGuard<'_, LimiterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a permit, waiting FIFO behind earlier callers.
    ///
    /// With a `timeout`, the call fails with [`CoreError::Timeout`] once the
    /// deadline fires; a `release()` that would have satisfied the timed-out
    /// waiter falls through to the next one in line instead.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<(), CoreError> {
        let (id, mut rx) = {
            let mut state = self.state();
            if state.available > 0 {
                state.available -= 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.queue.push_back(Waiter { id, tx });
            (id, rx)
        };

        let Some(limit) = timeout else {
            return match rx.await {
                Ok(WaitOutcome::Granted) => Ok(()),
                _ => Err(CoreError::Drained),
            };
        };

        tokio::select! {
            outcome = &mut rx => match outcome {
                Ok(WaitOutcome::Granted) => Ok(()),
                _ => Err(CoreError::Drained),
            },
            _ = tokio::time::sleep(limit) => {
                let still_queued = {
                    let mut state = self.state();
                    match state.queue.iter().position(|w| w.id == id) {
                        Some(index) => {
                            state.queue.remove(index);
                            true
                        }
                        None => false,
                    }
                };
                if still_queued {
                    return Err(CoreError::Timeout(limit.as_millis() as u64));
                }
                // The permit was handed over in the same instant the deadline
                // fired; honor the handoff.
                match rx.try_recv() {
                    Ok(WaitOutcome::Granted) => Ok(()),
                    _ => Err(CoreError::Drained),
                }
            }
        }
    }

    /// Non-blocking acquire; never queues.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state();
        if state.available > 0 {
            state.available -= 1;
            true
        } else {
            false
        }
    }

    /// Release a permit: hand it to the oldest live waiter, or return it to
    /// the pool.
    ///
    /// # Panics
    ///
    /// Panics if the release has no matching prior acquire — the permit
    /// count must never exceed the configured capacity.
    pub fn release(&self) {
        let mut state = self.state();
        loop {
            match state.queue.pop_front() {
                Some(waiter) => {
                    if waiter.tx.send(WaitOutcome::Granted).is_ok() {
                        return;
                    }
                    // Waiter gave up (timed out or dropped); hand to the next.
                }
                None => {
                    assert!(
                        state.available < self.inner.capacity,
                        "limiter release without a matching acquire"
                    );
                    state.available += 1;
                    return;
                }
            }
        }
    }

    /// Run `f` under a permit; the permit is released on every outcome,
    /// including a panic or a dropped future.
    pub async fn with_permit<T, F, Fut>(&self, timeout: Option<Duration>, f: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(timeout).await?;
        let _guard = ReleaseOnDrop { limiter: self };
        Ok(f().await)
    }

    /// Reject every queued waiter with [`CoreError::Drained`]. Used at
    /// shutdown so nobody blocks indefinitely.
    pub fn drain(&self) {
        let mut state = self.state();
        while let Some(waiter) = state.queue.pop_front() {
            let _ = waiter.tx.send(WaitOutcome::Drained);
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.state().available
    }

    /// Callers currently queued.
    pub fn waiting(&self) -> usize {
        self.state().queue.len()
    }
}

struct ReleaseOnDrop<'a> {
    limiter: &'a Limiter,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// Keyed limiters, created lazily on first use.
#[derive(Clone, Default)]
pub struct LimiterRegistry {
    limiters: Arc<Mutex<HashMap<String, Limiter>>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Limiter>> {
        self.limiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the limiter for `key`, creating it with `capacity` on first use.
    /// Later calls with a different capacity for the same key are ignored.
    pub fn get(&self, key: &str, capacity: usize) -> Limiter {
        self.map()
            .entry(key.to_string())
            .or_insert_with(|| Limiter::new(capacity))
            .clone()
    }

    /// Drain and drop the limiter for `key`.
    pub fn remove(&self, key: &str) {
        if let Some(limiter) = self.map().remove(key) {
            limiter.drain();
        }
    }

    /// Drain and drop every limiter.
    pub fn clear(&self) {
        let mut map = self.map();
        for limiter in map.values() {
            limiter.drain();
        }
        map.clear();
    }
}
