use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// FIFO of keys drained one finite round at a time.
///
/// A round takes `len()` items at its start; anything pushed during the round
/// (re-enqueues or new arrivals) lands at the tail and is handled next round.
#[derive(Debug)]
pub struct RoundQueue<K> {
    inner: Mutex<VecDeque<K>>,
}

impl<K: PartialEq + Clone> Default for RoundQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq + Clone> RoundQueue<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<K>> {
        // A panic while holding the lock leaves the deque itself intact
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append unless already queued
    pub fn push(&self, key: K) -> bool {
        let mut queue = self.lock();
        if queue.contains(&key) {
            return false;
        }
        queue.push_back(key);
        true
    }

    pub fn pop(&self) -> Option<K> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn remove(&self, key: &K) {
        self.lock().retain(|k| k != key);
    }

    pub fn snapshot(&self) -> Vec<K> {
        self.lock().iter().cloned().collect()
    }
}
