//! Cross-worker queues and startup readiness.
//!
//! [`NotifyQueue`] is the rendezvous between the receive path and the
//! verification/dispatch workers: a FIFO inbox plus a wake-up signal.
//! Spurious wake-ups are tolerated by construction; the consumer re-checks
//! the queue on every wake. [`Readiness`] gates producers until a worker's
//! owned resources exist, so posting before startup blocks instead of
//! failing.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::{Notify, watch};

/// Unbounded FIFO queue with a wake-up signal. Safe for any number of
/// producers; intended for a single draining consumer.
pub struct NotifyQueue<T> {
    items: Mutex<VecDeque<T>>,
    signal: Notify,
}

impl<T> NotifyQueue<T> {
    pub fn new() -> Self {
        Self { items: Mutex::new(VecDeque::new()), signal: Notify::new() }
    }

    /// Enqueue now; never blocks and never fails.
    pub fn put(&self, item: T) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
        self.signal.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Wait until an item is available and dequeue it.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.signal.notified().await;
        }
    }

    /// Wake the consumer without enqueueing (shutdown nudge).
    pub fn notify(&self) {
        self.signal.notify_one();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for NotifyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a readiness gate. The worker half flips it once its sockets and
/// queues are constructed; producer halves await it before posting.
pub fn readiness() -> (ReadySignal, Readiness) {
    let (tx, rx) = watch::channel(false);
    (ReadySignal { tx }, Readiness { rx })
}

pub struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    pub fn set_ready(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct Readiness {
    rx: watch::Receiver<bool>,
}

impl Readiness {
    /// Resolve once the owning worker is ready. Also resolves if the owner
    /// is gone, which only happens on shutdown.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let queue = NotifyQueue::new();
        for i in 0..100 {
            queue.put(i);
        }
        for i in 0..100 {
            assert_eq!(queue.pop().await, i);
        }
    }

    #[tokio::test]
    async fn pop_wakes_on_put() {
        let queue = Arc::new(NotifyQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(7u32);
        assert_eq!(consumer.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn producers_drain_without_loss() {
        let queue = Arc::new(NotifyQueue::new());
        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    queue.put((p, i));
                }
            }));
        }
        for handle in producers {
            handle.await.unwrap();
        }
        let mut count = 0;
        while queue.try_pop().is_some() {
            count += 1;
        }
        assert_eq!(count, 200);
    }

    #[tokio::test]
    async fn readiness_gates_until_set() {
        let (signal, ready) = readiness();
        assert!(!ready.is_ready());

        let waiter = {
            let ready = ready.clone();
            tokio::spawn(async move { ready.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.set_ready();
        waiter.await.unwrap();
        assert!(ready.is_ready());
    }
}
