//! Bounded drop-oldest queues between pipeline stages.
//!
//! The producer never blocks: publishing into a full queue evicts the
//! oldest item, so a stuck consumer costs recency instead of memory or
//! cadence. Consumers await asynchronously.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

// ── FrameQueue ───────────────────────────────────────────────────

/// A bounded FIFO with drop-oldest overflow and non-blocking publish.
#[derive(Debug)]
pub struct FrameQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish an item, evicting the oldest one if the queue is full.
    ///
    /// Returns the evicted item, if any. Never blocks.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut q = self.inner.lock().expect("queue poisoned");
            let evicted = if q.len() == self.capacity {
                q.pop_front()
            } else {
                None
            };
            q.push_back(item);
            evicted
        };

        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Take the next item, waiting until one is published.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            // Register interest before checking, so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.try_pop();
            }

            notified.await;
        }
    }

    /// Take the next item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().expect("queue poisoned").pop_front()
    }

    /// Close the queue: consumers drain the remaining items and then
    /// observe `None`. Publishing after close is a no-op.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items evicted by overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ── Tests ────────────────────────────────────────────────────────
