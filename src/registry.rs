//! The intrusive singly-linked thread registry.
//!
//! Both QSBR and EBR root their per-thread records in one of these. Each
//! registered thread gets a [`Node`] allocated once on `register` and
//! published into the list with a single compare-and-swap at the head.
//! Traversal (`iter`) never takes a lock; it walks the list with acquire
//! loads, relying on the release store that publishes a fully-initialized
//! node at insertion — a scenario the concurrent-registration test below
//! exercises.
//!
//! Removal is the caller's responsibility to sequence correctly: a thread
//! only ever removes its own node, and only after satisfying the
//! precondition ("not in a critical section and no concurrent
//! reclamation decision is in flight relying on its record"). Given that,
//! `remove` physically unlinks and frees the node with a compare-and-swap
//! on its predecessor's `next` pointer, retrying a full rescan from the
//! head if a concurrent insert or a different thread's removal changes the
//! predecessor out from under it.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    data: T,
    next: AtomicPtr<Node<T>>,
}

/// An opaque handle to a node previously returned by [`Registry::insert`].
pub(crate) struct Slot<T>(*mut Node<T>);

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Slot<T> {}

// The pointer is only ever dereferenced through `&Registry`, which is
// itself `Send + Sync` whenever `T` is; the slot carries no thread-affine
// state of its own.
unsafe impl<T: Send> Send for Slot<T> {}

/// A lock-free singly-linked list of per-thread records, rooted at an
/// atomic head pointer.
pub(crate) struct Registry<T> {
    head: AtomicPtr<Node<T>>,
}

unsafe impl<T: Send> Send for Registry<T> {}
unsafe impl<T: Send + Sync> Sync for Registry<T> {}

impl<T> Registry<T> {
    pub(crate) fn new() -> Self {
        Registry {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish a new record at the head of the registry. Lock-free: a
    /// single compare-and-swap loop, retried only on a racing insert.
    pub(crate) fn insert(&self, data: T) -> Slot<T> {
        let node = Box::into_raw(Box::new(Node {
            data,
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` was just allocated by us and is not yet
            // visible to any other thread.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return Slot(node),
                Err(actual) => head = actual,
            }
        }
    }

    /// Borrow the data stored at `slot`.
    ///
    /// # Safety
    /// `slot` must have been returned by `insert` on this registry and not
    /// yet passed to `remove`.
    pub(crate) unsafe fn data<'a>(&'a self, slot: Slot<T>) -> &'a T {
        &(*slot.0).data
    }

    /// Unlink and free the node at `slot`.
    ///
    /// # Safety
    /// The caller must guarantee (per the registry-removal
    /// precondition) that no concurrent scan of this registry still relies
    /// on observing this particular node, and that `slot` is removed at
    /// most once.
    pub(crate) unsafe fn remove(&self, slot: Slot<T>) {
        let target = slot.0;
        'retry: loop {
            let mut prev = &self.head;
            let mut curr = prev.load(Ordering::Acquire);
            while !curr.is_null() {
                if curr == target {
                    let next = (*target).next.load(Ordering::Acquire);
                    if prev
                        .compare_exchange(target, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        drop(Box::from_raw(target));
                        return;
                    }
                    // `prev` moved (a racing insert or a different thread's
                    // removal); rescan from the head.
                    continue 'retry;
                }
                prev = &(*curr).next;
                curr = prev.load(Ordering::Acquire);
            }
            // Already unlinked by a racing call; nothing left to do.
            return;
        }
    }

    /// Iterate over every currently-linked record, oldest-insertion-last.
    /// Uses acquire loads throughout; takes no lock.
    pub(crate) fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head.load(Ordering::Acquire),
            _marker: std::marker::PhantomData,
        }
    }
}

pub(crate) struct Iter<'a, T> {
    next: *mut Node<T>,
    _marker: std::marker::PhantomData<&'a Registry<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: nodes are never freed while a live `Slot` (and therefore
        // a possible concurrent `iter`) could still observe them, per the
        // registry-removal precondition callers must uphold.
        let node = unsafe { &*self.next };
        self.next = node.next.load(Ordering::Acquire);
        Some(&node.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_utils::thread::scope;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn insert_then_iter_sees_all() {
        let registry = Registry::new();
        let slots: Vec<_> = (0..8).map(|i| registry.insert(i)).collect();
        let mut seen: Vec<i32> = registry.iter().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        for slot in slots {
            unsafe { registry.remove(slot) };
        }
        assert_eq!(registry.iter().count(), 0);
    }

    #[test]
    fn remove_unlinks_only_target() {
        let registry = Registry::new();
        let a = registry.insert(1);
        let b = registry.insert(2);
        let c = registry.insert(3);
        unsafe { registry.remove(b) };
        let mut seen: Vec<i32> = registry.iter().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 3]);
        unsafe {
            registry.remove(a);
            registry.remove(c);
        }
        assert_eq!(registry.iter().count(), 0);
    }

    /// S5 — 64 threads register concurrently; the registry ends up with
    /// exactly 64 unique records.
    #[test]
    fn concurrent_registration_is_linearizable() {
        let registry: Registry<AtomicUsize> = Registry::new();
        scope(|s| {
            for i in 0..64 {
                s.spawn(|_| {
                    registry.insert(AtomicUsize::new(i));
                });
            }
        })
        .unwrap();

        let mut seen: Vec<usize> = registry
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }
}
