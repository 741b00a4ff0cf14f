//! Thread-safe bounded queue.
//!
//! A cross-thread mailbox for handing owned values between the engine
//! thread and workers. `put`/`get` block for at most a caller-supplied
//! millisecond budget against a full or empty queue; the vectorized
//! variants move batches under one lock round to amortize
//! synchronization cost. This is the only cross-thread data path in
//! the crate besides the engine's own postbox.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// Bounded multi-producer multi-consumer queue.
pub struct Mailbox<T> {
    inner: Mutex<Inner<T>>,
    /// Signaled when an item is added.
    filled: Condvar,
    /// Signaled when space frees up.
    drained: Condvar,
}

impl<T> Mailbox<T> {
    /// Create a mailbox holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Mailbox<T> {
        Mailbox {
            inner: Mutex::new(Inner { items: VecDeque::new(), capacity: capacity.max(1) }),
            filled: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Queue one item, waiting up to `millisec` ms for space.
    /// The item is handed back on timeout.
    pub fn put(&self, item: T, millisec: u64) -> Result<(), T> {
        let deadline = std::time::Instant::now() + Duration::from_millis(millisec);
        let mut inner = self.inner.lock();
        while inner.items.len() >= inner.capacity {
            if self.drained.wait_until(&mut inner, deadline).timed_out() {
                return Err(item);
            }
        }
        inner.items.push_back(item);
        drop(inner);
        self.filled.notify_one();
        Ok(())
    }

    /// Dequeue one item, waiting up to `millisec` ms for one to arrive.
    pub fn get(&self, millisec: u64) -> Option<T> {
        let deadline = std::time::Instant::now() + Duration::from_millis(millisec);
        let mut inner = self.inner.lock();
        while inner.items.is_empty() {
            if self.filled.wait_until(&mut inner, deadline).timed_out() {
                return None;
            }
        }
        let item = inner.items.pop_front();
        drop(inner);
        self.drained.notify_one();
        item
    }

    /// Inspect the front item without dequeueing it.
    pub fn peek_with<R>(&self, millisec: u64, f: impl FnOnce(&T) -> R) -> Option<R> {
        let deadline = std::time::Instant::now() + Duration::from_millis(millisec);
        let mut inner = self.inner.lock();
        while inner.items.is_empty() {
            if self.filled.wait_until(&mut inner, deadline).timed_out() {
                return None;
            }
        }
        inner.items.front().map(f)
    }

    /// Queue a batch under one lock round. Returns how many items
    /// entered the queue; the rest are handed back in order.
    pub fn put_vec(&self, items: Vec<T>, millisec: u64) -> (usize, Vec<T>) {
        let deadline = std::time::Instant::now() + Duration::from_millis(millisec);
        let mut items = VecDeque::from(items);
        let mut accepted = 0;
        let mut inner = self.inner.lock();
        while !items.is_empty() {
            while inner.items.len() < inner.capacity {
                match items.pop_front() {
                    Some(item) => {
                        inner.items.push_back(item);
                        accepted += 1;
                    }
                    None => break,
                }
            }
            if items.is_empty() {
                break;
            }
            if self.drained.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        drop(inner);
        if accepted > 0 {
            self.filled.notify_all();
        }
        (accepted, Vec::from(items))
    }

    /// Dequeue up to `max` items under one lock round, waiting up to
    /// `millisec` ms for the first. Returns how many were appended to
    /// `out`.
    pub fn get_vec(&self, out: &mut Vec<T>, max: usize, millisec: u64) -> usize {
        if max == 0 {
            return 0;
        }
        let deadline = std::time::Instant::now() + Duration::from_millis(millisec);
        let mut inner = self.inner.lock();
        while inner.items.is_empty() {
            if self.filled.wait_until(&mut inner, deadline).timed_out() {
                return 0;
            }
        }
        let take = inner.items.len().min(max);
        out.extend(inner.items.drain(..take));
        drop(inner);
        self.drained.notify_all();
        take
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn put_get_round_trip() {
        let mb = Mailbox::bounded(4);
        assert!(mb.put(1u32, 0).is_ok());
        assert!(mb.put(2, 0).is_ok());
        assert_eq!(mb.len(), 2);
        assert_eq!(mb.get(0), Some(1));
        assert_eq!(mb.get(0), Some(2));
        assert_eq!(mb.get(0), None);
    }

    #[test]
    fn full_queue_times_out_and_returns_item() {
        let mb = Mailbox::bounded(1);
        assert!(mb.put(1u32, 0).is_ok());
        assert_eq!(mb.put(2, 10), Err(2));
    }

    #[test]
    fn batch_put_get() {
        let mb = Mailbox::bounded(3);
        let (accepted, rest) = mb.put_vec(vec![1u32, 2, 3, 4, 5], 0);
        assert_eq!(accepted, 3);
        assert_eq!(rest, vec![4, 5]);
        let mut out = Vec::new();
        assert_eq!(mb.get_vec(&mut out, 8, 0), 3);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn cross_thread_handoff() {
        let mb = Arc::new(Mailbox::bounded(2));
        let producer = {
            let mb = Arc::clone(&mb);
            std::thread::spawn(move || {
                for i in 0..64u32 {
                    while mb.put(i, 1000).is_err() {}
                }
            })
        };
        let mut got = Vec::new();
        while got.len() < 64 {
            if let Some(v) = mb.get(1000) {
                got.push(v);
            }
        }
        producer.join().unwrap();
        assert_eq!(got, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn peek_does_not_consume() {
        let mb = Mailbox::bounded(2);
        mb.put(7u32, 0).unwrap();
        assert_eq!(mb.peek_with(0, |v| *v), Some(7));
        assert_eq!(mb.get(0), Some(7));
    }
}
