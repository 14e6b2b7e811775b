// crates/veilcast-core/src/queue.rs
//
// BoundedQueue: fixed-capacity FIFO with timed put/get and an atomic drain.
// Every stage-to-stage hop in the pipeline goes through one of these; the
// put timeout plus drop-newest policy is what turns downstream stalls into
// frame drops instead of unbounded memory growth.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a timed `put`.
///
/// `Dropped` hands the item back so the caller can decide whether to count
/// it (hot video path) or discard silently (VAD copy queue).
#[derive(Debug)]
pub enum PutOutcome<T> {
    Accepted,
    Dropped(T),
}

impl<T> PutOutcome<T> {
    pub fn accepted(&self) -> bool {
        matches!(self, PutOutcome::Accepted)
    }
}

/// Outcome of a timed `get`.
#[derive(Debug)]
pub enum GetOutcome<T> {
    Item(T),
    TimedOut,
}

impl<T> GetOutcome<T> {
    pub fn into_item(self) -> Option<T> {
        match self {
            GetOutcome::Item(item) => Some(item),
            GetOutcome::TimedOut => None,
        }
    }
}

pub struct BoundedQueue<T> {
    inner:     Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full:  Condvar,
    capacity:  usize,
    dropped:   AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner:     Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full:  Condvar::new(),
            capacity,
            dropped:   AtomicU64::new(0),
        }
    }

    /// Enqueue `item`, waiting up to `timeout` for room. On a full queue the
    /// newest item (this one) is dropped and returned.
    pub fn put(&self, item: T, timeout: Duration) -> PutOutcome<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap();
        while guard.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return PutOutcome::Dropped(item);
            }
            let (g, wait) = self
                .not_full
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
            if wait.timed_out() && guard.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return PutOutcome::Dropped(item);
            }
        }
        guard.push_back(item);
        drop(guard);
        self.not_empty.notify_one();
        PutOutcome::Accepted
    }

    /// Dequeue the oldest item, waiting up to `timeout` for one to arrive.
    pub fn get(&self, timeout: Duration) -> GetOutcome<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap();
        while guard.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return GetOutcome::TimedOut;
            }
            let (g, wait) = self
                .not_empty
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
            if wait.timed_out() && guard.is_empty() {
                return GetOutcome::TimedOut;
            }
        }
        let item = guard.pop_front().expect("non-empty after wait");
        drop(guard);
        self.not_full.notify_one();
        GetOutcome::Item(item)
    }

    /// Drain everything in one critical section. In-flight put/get calls
    /// complete first; operations that start afterwards see an empty queue.
    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.clear();
        drop(guard);
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items discarded by the drop-newest policy since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(10);

    #[test]
    fn fifo_order_preserved() {
        let q = BoundedQueue::new(4);
        for i in 0..4 {
            assert!(q.put(i, SHORT).accepted());
        }
        for i in 0..4 {
            assert_eq!(q.get(SHORT).into_item(), Some(i));
        }
    }

    #[test]
    fn full_queue_drops_newest() {
        let q = BoundedQueue::new(2);
        assert!(q.put(1, SHORT).accepted());
        assert!(q.put(2, SHORT).accepted());
        match q.put(3, SHORT) {
            PutOutcome::Dropped(item) => assert_eq!(item, 3),
            PutOutcome::Accepted => panic!("expected drop on full queue"),
        }
        assert_eq!(q.dropped(), 1);
        // Retained items keep their order.
        assert_eq!(q.get(SHORT).into_item(), Some(1));
        assert_eq!(q.get(SHORT).into_item(), Some(2));
    }

    #[test]
    fn get_times_out_on_empty() {
        let q: BoundedQueue<u32> = BoundedQueue::new(1);
        assert!(matches!(q.get(SHORT), GetOutcome::TimedOut));
    }

    #[test]
    fn clear_empties_queue() {
        let q = BoundedQueue::new(8);
        for i in 0..5 {
            assert!(q.put(i, SHORT).accepted());
        }
        q.clear();
        assert!(q.is_empty());
        assert!(matches!(q.get(SHORT), GetOutcome::TimedOut));
    }

    #[test]
    fn put_unblocks_when_consumer_drains() {
        let q = Arc::new(BoundedQueue::new(1));
        assert!(q.put(0u32, SHORT).accepted());

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.get(Duration::from_millis(200)).into_item()
            })
        };

        // Blocks until the consumer pops, then succeeds within the timeout.
        assert!(q.put(1u32, Duration::from_millis(500)).accepted());
        assert_eq!(consumer.join().unwrap(), Some(0));
        assert_eq!(q.get(SHORT).into_item(), Some(1));
    }

    #[test]
    fn multi_producer_multi_consumer_delivers_everything() {
        let q = Arc::new(BoundedQueue::new(16));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..50u32 {
                        // Generous timeout: nothing is dropped in this test.
                        assert!(q.put(p * 100 + i, Duration::from_secs(5)).accepted());
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while got.len() < 100 {
                        if let Some(item) = q.get(Duration::from_secs(5)).into_item() {
                            got.push(item);
                        }
                    }
                    got
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut all: Vec<u32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all.len(), 200);
        all.dedup();
        assert_eq!(all.len(), 200, "no duplicates, no losses");
    }
}
