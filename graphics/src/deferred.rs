//! Deferred release of GPU objects.
//!
//! GPU commands are executed asynchronously: the CPU records frame N+1 while
//! the GPU is still working on frame N. A resource the application releases
//! may therefore still be referenced by a submitted command list, so its
//! native object cannot be destroyed yet.
//!
//! [`DeferredQueue`] holds released objects together with the completion
//! value of the submission that last may use them. Once the queue's
//! completion counter reaches that value the objects are dropped.
//!
//! ```text
//! release(handle)          tag = next value to be signaled
//!   │
//!   ▼
//! ┌──────────────────────────────────────────┐
//! │ DeferredQueue (ordered by tag)           │
//! │  (5, tex)  (5, buf)  (6, pipeline)  ...  │
//! └──────────────────────────────────────────┘
//!   │
//!   ▼ collect(completed = 5)
//! tex, buf dropped; pipeline stays until 6 completes
//! ```

use std::collections::VecDeque;

/// Objects waiting for the GPU to pass a completion value.
#[derive(Debug)]
pub struct DeferredQueue<T> {
    pending: VecDeque<(u64, T)>,
}

impl<T> DeferredQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Queue `item` until the completion counter reaches `tag`.
    ///
    /// Tags are normally non-decreasing; an out-of-order tag is inserted in
    /// place so collection stays a prefix scan.
    pub fn push(&mut self, tag: u64, item: T) {
        match self.pending.back() {
            Some((last, _)) if *last > tag => {
                let index = self.pending.partition_point(|(t, _)| *t <= tag);
                self.pending.insert(index, (tag, item));
            }
            _ => self.pending.push_back((tag, item)),
        }
    }

    /// Remove and return every item whose tag is at most `completed`.
    pub fn collect(&mut self, completed: u64) -> Vec<T> {
        let count = self.pending.partition_point(|(t, _)| *t <= completed);
        self.pending.drain(..count).map(|(_, item)| item).collect()
    }

    /// Remove every item regardless of its tag.
    ///
    /// Only valid once the GPU is idle.
    pub fn flush_all(&mut self) -> Vec<T> {
        self.pending.drain(..).map(|(_, item)| item).collect()
    }

    /// Number of items still pending.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_respects_tags() {
        let mut queue = DeferredQueue::new();
        queue.push(1, "a");
        queue.push(2, "b");
        queue.push(2, "c");
        queue.push(4, "d");

        assert!(queue.collect(0).is_empty());
        assert_eq!(queue.collect(2), vec!["a", "b", "c"]);
        assert_eq!(queue.len(), 1);
        assert!(queue.collect(3).is_empty());
        assert_eq!(queue.collect(10), vec!["d"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_out_of_order_push() {
        let mut queue = DeferredQueue::new();
        queue.push(5, 'x');
        queue.push(3, 'y');
        assert_eq!(queue.collect(3), vec!['y']);
        assert_eq!(queue.flush_all(), vec!['x']);
    }
}
