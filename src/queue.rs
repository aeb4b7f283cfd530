// Bounded drop-oldest queue shared between an audio producer and a slower
// consumer. When full, the oldest unsent entry is evicted to admit the new
// one: audio recency is prioritized over completeness.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};

struct Inner<T> {
    items: VecDeque<T>,
    drops: u64,
}

/// Fixed-capacity FIFO that evicts the oldest entry instead of blocking
/// the producer or growing without bound.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                drops: 0,
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue an item, evicting the oldest entry if the queue is full.
    /// Returns true if an entry was dropped.
    pub fn push(&self, item: T) -> bool {
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            let dropped = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.drops += 1;
                true
            } else {
                false
            };
            inner.items.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    /// Pop the next item, waiting up to `wait` for one to arrive.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if timeout(remaining, self.notify.notified()).await.is_err() {
                // Last look before reporting the timeout
                return self.pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries evicted so far.
    pub fn drops(&self) -> u64 {
        self.inner.lock().unwrap().drops
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = BoundedQueue::new(4);
        q.push(1);
        q.push(2);
        q.push(3);

        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_push_at_capacity_evicts_oldest() {
        let q = BoundedQueue::new(2);
        assert!(!q.push(1));
        assert!(!q.push(2));
        assert!(q.push(3)); // evicts 1

        assert_eq!(q.len(), 2);
        assert_eq!(q.drops(), 1);
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[tokio::test]
    async fn test_pop_timeout_returns_none_when_idle() {
        let q: BoundedQueue<u8> = BoundedQueue::new(4);
        let got = q.pop_timeout(Duration::from_millis(20)).await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_pop_timeout_wakes_on_push() {
        let q = std::sync::Arc::new(BoundedQueue::new(4));
        let q2 = std::sync::Arc::clone(&q);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            q2.push(7u8);
        });

        let got = q.pop_timeout(Duration::from_secs(1)).await;
        assert_eq!(got, Some(7));
    }
}
