//! # Buffer Descriptor FIFO
//!
//! A bounded, re-entrantly-locked queue of `{timestamp, buf_index,
//! sample_count}` descriptors, one per local audio channel group, used
//! to align network-side presentation timing with a local ring buffer's
//! write positions.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::collections::VecDeque;

/// One descriptor: the samples written starting at `buf_index` in the
/// owning ring buffer, tagged with the local time they were written and
/// how many samples they cover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioBufferDesc {
    /// Local time at which the samples were written.
    pub timestamp: u64,
    /// Virtual ring-buffer position the samples start at.
    pub buf_index: u64,
    /// Number of samples covered by this descriptor.
    pub sample_count: u32,
}

/// Bounded descriptor queue. Internally ordered oldest-first; `enqueue`
/// evicts the oldest entry once the queue is at capacity, `dequeue`
/// removes and returns the oldest, and `peek_x(n)` looks `n` places in
/// from the oldest end without removing anything.
///
/// The lock is re-entrant so a caller can take it once (via
/// [`DescriptorFifo::lock`]) to pair a `peek`/`peek_x` with other state
/// it wants to read atomically, since those methods take the lock
/// again internally.
pub struct DescriptorFifo {
    mutex: ReentrantMutex<RefCell<Inner>>,
}

struct Inner {
    queue: VecDeque<AudioBufferDesc>,
    capacity: usize,
    reset_request: bool,
}

/// A held lock on the FIFO's mutex, for pairing an explicit lock/unlock
/// span with one or more `peek`/`peek_x` calls.
pub struct FifoGuard<'a>(ReentrantMutexGuard<'a, RefCell<Inner>>);

impl DescriptorFifo {
    /// Builds an empty FIFO bounded to `capacity` descriptors.
    pub fn new(capacity: usize) -> Self {
        Self {
            mutex: ReentrantMutex::new(RefCell::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                reset_request: false,
            })),
        }
    }

    /// Takes the FIFO's lock, returning a guard that keeps it held until
    /// dropped.
    pub fn lock(&self) -> FifoGuard<'_> {
        FifoGuard(self.mutex.lock())
    }

    /// Adds a descriptor, evicting the oldest one first if the queue is
    /// already at capacity.
    pub fn enqueue(&self, desc: AudioBufferDesc) {
        let guard = self.mutex.lock();
        let mut inner = guard.borrow_mut();
        if inner.queue.len() >= inner.capacity {
            inner.queue.pop_front();
        }
        inner.queue.push_back(desc);
    }

    /// Removes and returns the oldest descriptor, or `None` if empty.
    pub fn dequeue(&self) -> Option<AudioBufferDesc> {
        let guard = self.mutex.lock();
        guard.borrow_mut().queue.pop_front()
    }

    /// Returns the oldest descriptor without removing it.
    pub fn peek(&self) -> Option<AudioBufferDesc> {
        self.peek_x(0)
    }

    /// Returns the descriptor `index` places in from the oldest end,
    /// without removing it. `peek_x(0)` is the same as `peek()`.
    pub fn peek_x(&self, index: usize) -> Option<AudioBufferDesc> {
        let guard = self.mutex.lock();
        guard.borrow().queue.get(index).copied()
    }

    /// Empties the queue and raises the one-shot reset-request flag.
    pub fn reset(&self) {
        let guard = self.mutex.lock();
        let mut inner = guard.borrow_mut();
        inner.queue.clear();
        inner.reset_request = true;
    }

    /// Current number of queued descriptors.
    pub fn len(&self) -> usize {
        self.mutex.lock().borrow().queue.len()
    }

    /// Whether the queue currently holds no descriptors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raises the reset-request flag without clearing the queue.
    pub fn set_reset_request(&self) {
        self.mutex.lock().borrow_mut().reset_request = true;
    }

    /// Reads and clears the reset-request flag.
    pub fn get_reset_request(&self) -> bool {
        let guard = self.mutex.lock();
        let mut inner = guard.borrow_mut();
        let ret = inner.reset_request;
        inner.reset_request = false;
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(buf_index: u64) -> AudioBufferDesc {
        AudioBufferDesc {
            timestamp: 0,
            buf_index,
            sample_count: 8,
        }
    }

    #[test]
    fn s4_empty_fifo_peek_and_dequeue_return_none() {
        let fifo = DescriptorFifo::new(2);
        assert_eq!(fifo.dequeue(), None);
        assert_eq!(fifo.peek(), None);
        assert_eq!(fifo.peek_x(1), None);
    }

    #[test]
    fn s4_single_entry_peek_matches_oldest() {
        let fifo = DescriptorFifo::new(2);
        fifo.enqueue(desc(0));
        assert_eq!(fifo.peek().unwrap().buf_index, 0);
        assert_eq!(fifo.peek_x(1), None);
    }

    #[test]
    fn s4_two_entries_preserve_oldest_first_order() {
        let fifo = DescriptorFifo::new(2);
        fifo.enqueue(desc(0));
        fifo.enqueue(desc(1));
        assert_eq!(fifo.peek().unwrap().buf_index, 0);
        assert_eq!(fifo.peek_x(1).unwrap().buf_index, 1);
        assert_eq!(fifo.peek_x(2), None);
    }

    #[test]
    fn s4_overflow_evicts_oldest() {
        let fifo = DescriptorFifo::new(2);
        fifo.enqueue(desc(0));
        fifo.enqueue(desc(1));
        fifo.enqueue(desc(2));
        assert_eq!(fifo.len(), 2);
        assert_eq!(fifo.peek().unwrap().buf_index, 1);
        assert_eq!(fifo.peek_x(1).unwrap().buf_index, 2);
    }

    #[test]
    fn p3_bound_never_exceeded_and_dequeue_order() {
        let fifo = DescriptorFifo::new(3);
        for i in 0..10u64 {
            fifo.enqueue(desc(i));
            assert!(fifo.len() <= 3);
        }
        assert_eq!(fifo.dequeue().unwrap().buf_index, 7);
        assert_eq!(fifo.dequeue().unwrap().buf_index, 8);
        assert_eq!(fifo.dequeue().unwrap().buf_index, 9);
        assert_eq!(fifo.dequeue(), None);
    }

    #[test]
    fn reset_clears_queue_and_raises_flag() {
        let fifo = DescriptorFifo::new(2);
        fifo.enqueue(desc(0));
        fifo.reset();
        assert!(fifo.is_empty());
        assert!(fifo.get_reset_request());
        assert!(!fifo.get_reset_request());
    }

    #[test]
    fn lock_allows_reentrant_peek() {
        let fifo = DescriptorFifo::new(2);
        fifo.enqueue(desc(5));
        let _guard = fifo.lock();
        assert_eq!(fifo.peek().unwrap().buf_index, 5);
    }
}
