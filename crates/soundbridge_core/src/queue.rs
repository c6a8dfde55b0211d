//! Bounded, drop-oldest chunk queues backing the data channel's tx/rx sides.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// A `VecDeque`-backed queue with a fixed capacity. Pushing past capacity
/// silently drops the oldest element, backing both the data channel's
/// outgoing and incoming chunk buffers.
pub struct RingQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> RingQueue<T> {
    /// `capacity` of zero degenerates to a queue that always stays empty;
    /// callers size this as `(BUFFER_TIME / chunk_duration) as usize`,
    /// which is always at least 1 for the configs this crate validates.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    /// Push one element, dropping the oldest if already at capacity.
    pub fn push(&self, item: T) {
        let mut guard = self.inner.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(item);
    }

    /// Pop the oldest element, if any.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl RingQueue<Vec<u8>> {
    /// Pop up to `n` chunks, in FIFO order, stopping early if the queue runs
    /// dry. Used by the sender loop to aggregate several chunks into one
    /// packet.
    pub fn pop_up_to(&self, n: usize) -> Vec<Vec<u8>> {
        let mut guard = self.inner.lock();
        let take = n.min(guard.len());
        guard.drain(..take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_never_exceeded() {
        let q: RingQueue<u32> = RingQueue::new(4);
        for i in 0..100 {
            q.push(i);
            assert!(q.len() <= 4);
        }
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let q: RingQueue<u32> = RingQueue::new(2);
        q.push(1);
        q.push(2);
        q.push(3); // drops 1
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_fifo_order() {
        let q: RingQueue<u32> = RingQueue::new(8);
        for i in 0..5 {
            q.push(i);
        }
        for i in 0..5 {
            assert_eq!(q.pop(), Some(i));
        }
    }

    #[test]
    fn test_pop_up_to_partial() {
        let q: RingQueue<Vec<u8>> = RingQueue::new(8);
        q.push(vec![1]);
        q.push(vec![2]);
        let popped = q.pop_up_to(5);
        assert_eq!(popped, vec![vec![1], vec![2]]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped_to_one() {
        let q: RingQueue<u32> = RingQueue::new(0);
        assert_eq!(q.capacity(), 1);
        q.push(1);
        q.push(2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some(2));
    }
}
