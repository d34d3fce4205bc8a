//! Lock-free FIFO list backing each queue channel.
//!
//! Producers push onto an atomic inbox with a plain CAS loop and never take a
//! lock. Consumers serialize on a short mutex guarding an ordered out-list;
//! when the out-list runs dry the whole inbox is detached with one `swap` and
//! reversed into submission order. Popped values therefore come out in the
//! order they were pushed, and every pushed value is popped exactly once.

use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

pub struct LocklessList<T> {
    // Padded so producer CAS traffic does not bounce the consumers' mutex line.
    inbox: CachePadded<AtomicPtr<Node<T>>>,
    out: Mutex<VecDeque<T>>,
}

unsafe impl<T: Send> Send for LocklessList<T> {}
unsafe impl<T: Send> Sync for LocklessList<T> {}

impl<T> LocklessList<T> {
    pub fn new() -> Self {
        Self {
            inbox: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            out: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a value. Wait-free apart from the CAS retry loop.
    pub fn push_back(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        let mut head = self.inbox.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self
                .inbox
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Removes and returns the oldest value, or `None` if the list is empty.
    pub fn pop_front(&self) -> Option<T> {
        let mut out = self.out.lock();
        if out.is_empty() {
            Self::drain_inbox(&self.inbox, &mut out);
        }
        out.pop_front()
    }

    /// Removes every value matching `pred` and hands them back to the caller.
    ///
    /// Returning the removed values lets the caller drop them outside the
    /// list's internal lock; dropping a value may release arbitrary resources.
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut out = self.out.lock();
        Self::drain_inbox(&self.inbox, &mut out);
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(out.len());
        for value in out.drain(..) {
            if pred(&value) {
                removed.push(value);
            } else {
                kept.push_back(value);
            }
        }
        *out = kept;
        drop(out);
        removed
    }

    /// Racy emptiness probe; a concurrent push can invalidate the answer
    /// before it is returned.
    pub fn is_empty(&self) -> bool {
        self.out.lock().is_empty() && self.inbox.load(Ordering::Acquire).is_null()
    }

    // Detaches the whole inbox and appends it to `out` in submission order.
    // The inbox chain is newest-first, so it is reversed on the way over.
    fn drain_inbox(inbox: &AtomicPtr<Node<T>>, out: &mut VecDeque<T>) {
        let mut head = inbox.swap(ptr::null_mut(), Ordering::Acquire);
        let mut reversed = Vec::new();
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            reversed.push(node.value);
        }
        while let Some(value) = reversed.pop() {
            out.push_back(value);
        }
    }
}

impl<T> Default for LocklessList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LocklessList<T> {
    fn drop(&mut self) {
        let out = self.out.get_mut();
        Self::drain_inbox(&self.inbox, out);
        out.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_order() {
        let list = LocklessList::new();
        assert!(list.is_empty());
        for i in 0..16u32 {
            list.push_back(i);
        }
        assert!(!list.is_empty());
        for i in 0..16u32 {
            assert_eq!(list.pop_front(), Some(i));
        }
        assert_eq!(list.pop_front(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn interleaved_push_pop_keeps_order() {
        let list = LocklessList::new();
        list.push_back(1u32);
        list.push_back(2);
        assert_eq!(list.pop_front(), Some(1));
        list.push_back(3);
        assert_eq!(list.pop_front(), Some(2));
        assert_eq!(list.pop_front(), Some(3));
    }

    #[test]
    fn remove_where_hands_back_matches() {
        let list = LocklessList::new();
        for i in 0..10u32 {
            list.push_back(i);
        }
        let removed = list.remove_where(|v| v % 2 == 0);
        assert_eq!(removed, vec![0, 2, 4, 6, 8]);
        let mut rest = Vec::new();
        while let Some(v) = list.pop_front() {
            rest.push(v);
        }
        assert_eq!(rest, vec![1, 3, 5, 7, 9]);
    }
}
