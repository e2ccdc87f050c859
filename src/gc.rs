//! Deferred reclamation queue.
//!
//! Wraps either backend behind one trait so [`Gc`] is generic over QSBR
//! and EBR alike: each backend already tags newly-retired objects with
//! [`SmrBackend::staging_epoch`] and reports whether a tag is reclaimable
//! with [`SmrBackend::is_safe`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::epoch_width::Epoch;
use crate::error::SmrError;

/// Default sleep between drain attempts in [`Gc::flush`], for callers
/// with no stronger opinion of their own.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// What [`Gc`] needs from a registered SMR handle. Implemented by
/// [`crate::qsbr::QsbrHandle`] and [`crate::ebr::EbrHandle`].
pub trait SmrBackend {
    /// The tag a pointer retired right now should be stamped with.
    fn staging_epoch(&self) -> Epoch;

    /// Is `tag` old enough that every reader who could have observed the
    /// pointer retired under it has since moved on?
    fn is_safe(&self, tag: Epoch) -> bool;

    /// Drive the backend forward one step (a QSBR barrier, or an EBR
    /// `sync` attempt), returning the epoch reached. Used by [`Gc::flush`].
    fn advance(&self) -> Epoch;
}

struct Entry<T> {
    tag: Epoch,
    ptr: *mut T,
}

// The pointer is opaque to the queue itself; only `destructor` ever
// dereferences it, and only after `is_safe` confirms no reader can.
unsafe impl<T: Send> Send for Entry<T> {}

/// A FIFO of objects retired under a backend `B`, drained as their tags
/// become safe to reclaim.
pub struct Gc<T, B: SmrBackend> {
    backend: B,
    destructor: fn(*mut T),
    queue: Mutex<VecDeque<Entry<T>>>,
}

impl<T, B: SmrBackend> Gc<T, B> {
    /// Create a GC instance backed by `backend`, using `destructor` to
    /// reclaim each retired pointer exactly once.
    ///
    /// Rust function pointers cannot be null, so a non-null destructor is
    /// guaranteed unconditionally; see [`SmrError::OutOfMemory`] for why
    /// this still returns a `Result`.
    pub fn create(destructor: fn(*mut T), backend: B) -> Result<Self, SmrError> {
        Ok(Gc {
            backend,
            destructor,
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Append `ptr` to the retirement queue, tagged with the backend's
    /// current staging epoch. Lock-free in the single-writer case only
    /// to the extent the backend's own `staging_epoch` is; the queue
    /// itself always serializes concurrent callers through a mutex, so
    /// multiple writers never need to arrange their own exclusion.
    pub fn limbo(&self, ptr: *mut T) {
        let tag = self.backend.staging_epoch();
        self.queue.lock().unwrap().push_back(Entry { tag, ptr });
    }

    /// Are there unreclaimed entries? Informational only; racy the
    /// instant it returns under concurrent `limbo`/`async_flush` calls.
    pub fn full_pending(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    /// Drain every entry at the head of the queue whose tag the backend
    /// now reports safe, invoking the destructor for each in FIFO order.
    /// Stops at the first entry that isn't yet safe. Returns `true` iff
    /// the queue is empty on exit.
    pub fn async_flush(&self) -> bool {
        let mut queue = self.queue.lock().unwrap();
        while let Some(entry) = queue.front() {
            if !self.backend.is_safe(entry.tag) {
                break;
            }
            let entry = queue.pop_front().unwrap();
            (self.destructor)(entry.ptr);
        }
        queue.is_empty()
    }

    /// Drive the backend forward, then poll [`async_flush`](Self::async_flush)
    /// with `poll_interval` between attempts until the queue is empty.
    pub fn flush(&self, poll_interval: Duration) {
        self.backend.advance();
        while !self.async_flush() {
            std::thread::sleep(poll_interval);
        }
    }

    /// The backend this instance retires through.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<T, B: SmrBackend> Drop for Gc<T, B> {
    fn drop(&mut self) {
        let mut queue = self.queue.lock().unwrap();
        if !queue.is_empty() {
            tracing::debug!(
                pending = queue.len(),
                "gc dropped with entries still in limbo"
            );
        }
        for entry in queue.drain(..) {
            (self.destructor)(entry.ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qsbr::Qsbr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noop(_: *mut AtomicUsize) {}

    #[test]
    fn async_flush_on_empty_queue_returns_true() {
        let qsbr = Qsbr::new();
        let handle = qsbr.register().unwrap();
        let gc: Gc<AtomicUsize, _> = Gc::create(noop, handle).unwrap();
        assert!(!gc.full_pending());
        assert!(gc.async_flush());
    }

    #[test]
    fn destructor_runs_in_fifo_order_once_safe() {
        let qsbr = Qsbr::new();
        let handle = qsbr.register().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Entry {
            order: Arc<Mutex<Vec<usize>>>,
            id: usize,
        }
        fn reclaim(ptr: *mut Entry) {
            let entry = unsafe { Box::from_raw(ptr) };
            entry.order.lock().unwrap().push(entry.id);
        }

        let gc: Gc<Entry, _> = Gc::create(reclaim, handle).unwrap();
        for id in 0..5 {
            let raw = Box::into_raw(Box::new(Entry {
                order: order.clone(),
                id,
            }));
            gc.limbo(raw);
        }
        assert!(gc.full_pending());

        gc.flush(Duration::from_millis(1));
        assert!(!gc.full_pending());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn async_flush_stops_at_first_unsafe_entry() {
        let qsbr = Qsbr::new();
        let writer = qsbr.register().unwrap();
        let reader = qsbr.register().unwrap();
        // Publish the reader at the current epoch so it counts as an
        // active (non-offline) thread that `sync` must wait on.
        reader.thread_online();

        let counter = Arc::new(AtomicUsize::new(0));
        struct Entry {
            counter: Arc<AtomicUsize>,
        }
        fn reclaim(ptr: *mut Entry) {
            let entry = unsafe { Box::from_raw(ptr) };
            entry.counter.fetch_add(1, Ordering::Relaxed);
        }

        let gc: Gc<Entry, _> = Gc::create(reclaim, writer).unwrap();
        let raw = Box::into_raw(Box::new(Entry {
            counter: counter.clone(),
        }));
        gc.limbo(raw);

        // `reader` has not checkpointed past the tag `limbo` assigned, so
        // the entry cannot yet be reported safe.
        assert!(!gc.async_flush());
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        reader.checkpoint();
        assert!(gc.async_flush());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
