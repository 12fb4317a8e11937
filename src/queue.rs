//! Deduplicating, rate-limited work queue.
//!
//! An item is in at most one of two places at a time: waiting in the queue, or
//! being processed by a worker. Adding an item that is already waiting is a
//! no-op, and adding an item that is being processed marks it dirty so it is
//! queued again once the worker calls [`WorkQueue::done`].

use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub mod rate_limiter;
pub use rate_limiter::{default_controller_rate_limiter, RateLimiter};

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    limiter: Mutex<Box<dyn RateLimiter<T>>>,
    notify: Notify,
    shutdown: CancellationToken,
}

/// A cloneable handle to a shared work queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                }),
                limiter: Mutex::new(Box::new(limiter)),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Marks `item` as needing processing.
    pub fn add(&self, item: T) {
        if self.is_shutting_down() {
            return;
        }

        let mut state = self.shared.state.lock();
        if state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);

        self.shared.notify.notify_one();
    }

    /// Adds `item` once `delay` has elapsed, unless the queue shuts down first.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = queue.shared.shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Adds `item` after the delay the rate limiter assigns to it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.shared.limiter.lock().when(&item);
        self.add_after(item, delay);
    }

    /// Stops rate limiting `item`, resetting its backoff.
    pub fn forget(&self, item: &T) {
        self.shared.limiter.lock().forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared.limiter.lock().num_requeues(item)
    }

    /// Waits for the next item, or returns `None` once the queue has been shut down.
    ///
    /// The returned item must be passed to [`done`](Self::done) when processing ends.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutting_down() {
                return None;
            }

            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // pass the wakeup on, a single notify may have covered several adds
                        self.shared.notify.notify_one();
                    }
                    return Some(item);
                }
            }

            tokio::select! {
                () = notified => {}
                () = self.shared.shutdown.cancelled() => return None,
            }
        }
    }

    /// Ends processing of `item`, re-queueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.shared.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Wakes all waiting workers with `None` and drops pending delayed adds.
    pub fn shut_down(&self) {
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Number of items waiting to be picked up.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
