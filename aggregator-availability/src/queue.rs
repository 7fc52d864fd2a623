//! Deduplicating work queue with per-key retry backoff
//!
//! Keys waiting for (re)evaluation are deduplicated: at most one pending
//! instance of a key exists at any time, and a key is never handed to two
//! workers concurrently. A key re-added while it is being processed is
//! re-queued once the processing worker calls [`WorkQueue::done`].

use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Compute the retry delay for a key that has failed `failures` times before.
///
/// Doubles on every failure starting from `base`, saturating at `cap`.
pub fn backoff_delay(base: Duration, cap: Duration, failures: u32) -> Duration {
    base.checked_mul(2u32.saturating_pow(failures.min(31)))
        .map_or(cap, |delay| delay.min(cap))
}

#[derive(Default)]
struct Inner<T> {
    /// Keys ready to be handed out, in arrival order.
    queue: VecDeque<T>,
    /// All keys currently known to the queue (ready or deferred).
    dirty: HashSet<T>,
    /// Keys currently held by a worker.
    processing: HashSet<T>,
    /// Consecutive failure count per key, cleared by `forget`.
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

/// A deduplicating, rate-limited queue of keys awaiting (re)evaluation.
///
/// Modelled after the classic controller work queue: `add` marks a key dirty,
/// `get` blocks until a key is ready and marks it processing, `done` releases
/// it (re-queueing if it went dirty again in the meantime), `retry` re-adds it
/// after an exponential per-key delay, and `forget` resets that delay.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    retry_base: Duration,
    retry_cap: Duration,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    #[must_use]
    pub fn new(retry_base: Duration, retry_cap: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            retry_base,
            retry_cap,
        }
    }

    /// Add a key to the queue unless it is already pending.
    ///
    /// A key that is currently being processed is deferred: it will be
    /// re-queued when the processing worker calls [`done`](Self::done).
    pub fn add(&self, key: T) {
        let mut inner = self.inner.lock();
        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if !inner.processing.contains(&key) {
            inner.queue.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Block until a key is ready, or return `None` once the queue shuts down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state, so a wakeup issued
            // between the check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a key as finished processing.
    ///
    /// If the key was re-added while it was being processed it goes straight
    /// back into the ready queue.
    pub fn done(&self, key: &T) {
        let mut inner = self.inner.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Re-add a key after its per-key backoff delay.
    ///
    /// Each consecutive `retry` for the same key doubles the delay, up to the
    /// configured cap. Returns the delay that was applied.
    pub fn retry(self: &Arc<Self>, key: T) -> Duration {
        let delay = {
            let mut inner = self.inner.lock();
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let seen = *failures;
            *failures += 1;
            backoff_delay(self.retry_base, self.retry_cap, seen)
        };
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
        delay
    }

    /// Reset the failure count for a key after a successful evaluation.
    pub fn forget(&self, key: &T) {
        self.inner.lock().failures.remove(key);
    }

    /// Stop handing out keys and unblock all pending [`get`](Self::get) calls.
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Number of keys ready to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
