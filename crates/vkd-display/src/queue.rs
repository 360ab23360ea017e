// SPDX-License-Identifier: CEPL-1.0
use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Unbounded double-ended queue shared between threads.
///
/// `pop` blocks until an item is available. All other operations return
/// immediately.
pub struct ConcurrentQueue<T> {
    items: Mutex<VecDeque<T>>,
    non_empty: Condvar,
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcurrentQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            non_empty: Condvar::new(),
        }
    }

    pub fn push_back(&self, item: T) {
        self.items.lock().push_back(item);
        self.non_empty.notify_one();
    }

    pub fn push_front(&self, item: T) {
        self.items.lock().push_front(item);
        self.non_empty.notify_one();
    }

    /// Removes the front item, waiting for one to arrive if the queue is empty.
    pub fn pop(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.non_empty.wait(&mut items);
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// If more than `threshold` queued items are accepted by `reclaimable`,
    /// removes and returns the front-most of them. Rejected items neither
    /// count nor move.
    pub fn try_reclaim_if_over<F>(&self, threshold: usize, mut reclaimable: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut items = self.items.lock();
        let mut accepted = items
            .iter()
            .enumerate()
            .filter(|(_, item)| reclaimable(item))
            .map(|(position, _)| position);
        let first = accepted.next()?;
        if accepted.count() < threshold {
            return None;
        }
        items.remove(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let q = ConcurrentQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);
        assert_eq!(q.pop(), 1);
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.pop(), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn test_push_front_jumps_the_line() {
        let q = ConcurrentQueue::new();
        q.push_back(1);
        q.push_front(0);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), 0);
    }

    #[test]
    fn test_try_pop_empty() {
        let q: ConcurrentQueue<u32> = ConcurrentQueue::new();
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let q = Arc::new(ConcurrentQueue::new());
        let (tx, rx) = mpsc::channel();

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || tx.send(q.pop()).unwrap())
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        q.push_back(7u32);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        consumer.join().unwrap();
    }

    #[test]
    fn test_reclaim_respects_threshold() {
        let q = ConcurrentQueue::new();
        q.push_back(1);
        q.push_back(2);
        assert_eq!(q.try_reclaim_if_over(2, |_| true), None);
        q.push_back(3);
        assert_eq!(q.try_reclaim_if_over(2, |_| true), Some(1));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_reclaim_skips_rejected_items() {
        let q = ConcurrentQueue::new();
        for i in 0..4 {
            q.push_back(i);
        }
        assert_eq!(q.try_reclaim_if_over(1, |&i| i % 2 == 1), Some(1));
        assert_eq!(q.pop(), 0);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 3);
    }

    #[test]
    fn test_reclaim_threshold_counts_accepted_only() {
        let q = ConcurrentQueue::new();
        for i in [0, 2, 1, 4] {
            q.push_back(i);
        }
        assert_eq!(q.try_reclaim_if_over(1, |&i| i % 2 == 1), None);
        q.push_back(3);
        assert_eq!(q.try_reclaim_if_over(1, |&i| i % 2 == 1), Some(1));
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_reclaim_none_accepted() {
        let q = ConcurrentQueue::new();
        q.push_back(1);
        q.push_back(2);
        assert_eq!(q.try_reclaim_if_over(0, |_| false), None);
        assert_eq!(q.len(), 2);
    }
}
