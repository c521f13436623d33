//! Segmented work-stealing worklist.
//!
//! Every thread owns a [`Local`] view backed by a double-ended
//! `crossbeam_deque::Worker`. Once a local view holds a full segment of items,
//! the segment is published to the shared `Injector` where any other thread can
//! steal it.

use crossbeam_deque::{Injector, Steal, Worker};

pub const SEGMENT_SIZE: usize = 64;

pub struct Worklist<T> {
    global: Injector<T>,
}

impl<T> Default for Worklist<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Worklist<T> {
    pub fn new() -> Self {
        Self {
            global: Injector::new(),
        }
    }

    /// Whether the shared part of the worklist is empty. Locals may still hold items.
    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    pub fn len(&self) -> usize {
        self.global.len()
    }

    pub fn push(&self, item: T) {
        self.global.push(item);
    }

    /// Drops every published item.
    pub fn clear(&self) {
        loop {
            match self.global.steal() {
                Steal::Empty => break,
                Steal::Success(_) | Steal::Retry => continue,
            }
        }
    }

    pub fn local(&self) -> Local<'_, T> {
        Local {
            global: self,
            local: Worker::new_lifo(),
        }
    }
}

pub struct Local<'a, T> {
    global: &'a Worklist<T>,
    local: Worker<T>,
}

impl<'a, T> Local<'a, T> {
    #[inline]
    pub fn push(&mut self, item: T) {
        self.local.push(item);
        if self.local.len() >= 2 * SEGMENT_SIZE {
            self.publish_segment();
        }
    }

    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        if let Some(item) = self.local.pop() {
            return Some(item);
        }
        loop {
            match self.global.global.steal_batch_and_pop(&self.local) {
                Steal::Success(item) => return Some(item),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn is_local_empty(&self) -> bool {
        self.local.is_empty()
    }

    pub fn is_global_empty(&self) -> bool {
        self.global.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.is_local_empty() && self.is_global_empty()
    }

    fn publish_segment(&mut self) {
        // The oldest items sit at the bottom of the LIFO deque; hand out the
        // newest ones and keep tracing locally what was pushed first.
        for _ in 0..SEGMENT_SIZE {
            match self.local.pop() {
                Some(item) => self.global.global.push(item),
                None => break,
            }
        }
    }

    /// Moves all local items to the shared worklist.
    pub fn publish(&mut self) {
        while let Some(item) = self.local.pop() {
            self.global.global.push(item);
        }
    }
}

impl<'a, T> Drop for Local<'a, T> {
    fn drop(&mut self) {
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_local_push_pop() {
        let worklist = Worklist::new();
        let mut local = worklist.local();
        local.push(1);
        local.push(2);
        assert_eq!(local.pop(), Some(2));
        assert_eq!(local.pop(), Some(1));
        assert_eq!(local.pop(), None);
        assert!(local.is_empty());
    }

    #[test]
    fn test_segments_are_published() {
        let worklist = Worklist::new();
        {
            let mut local = worklist.local();
            for i in 0..(2 * SEGMENT_SIZE) {
                local.push(i);
            }
            assert!(!worklist.is_empty());
        }
        assert_eq!(worklist.len(), 2 * SEGMENT_SIZE);
        let mut other = worklist.local();
        let mut count = 0;
        while other.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, 2 * SEGMENT_SIZE);
    }

    #[test]
    fn test_concurrent_draining() {
        let worklist = Worklist::new();
        for i in 0..10_000usize {
            worklist.push(i);
        }
        let seen = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut local = worklist.local();
                    while local.pop().is_some() {
                        seen.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(seen.load(Ordering::Relaxed), 10_000);
        assert!(worklist.is_empty());
    }

    #[test]
    fn test_clear() {
        let worklist = Worklist::new();
        worklist.push(1u32);
        worklist.push(2u32);
        worklist.clear();
        assert!(worklist.is_empty());
    }
}
