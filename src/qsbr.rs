//! Quiescent-State-Based Reclamation.
//!
//! Readers periodically declare *quiescent* points with [`QsbrHandle::checkpoint`]
//! — moments when they demonstrably hold no reference to a protected
//! object. A thread that will be idle for an unbounded time can declare
//! itself [`QsbrHandle::thread_offline`] so writers stop waiting on it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use atomic::Atomic;
use crossbeam_utils::CachePadded;

use crate::epoch_width::Epoch;
use crate::error::SmrError;
use crate::gc::SmrBackend;
use crate::registry::{Registry, Slot};

/// The reserved local-epoch value meaning "extended quiescent state".
/// Excluded from every `>=` comparison `sync` performs.
pub const OFFLINE: Epoch = 1;

/// The first value the global epoch takes; chosen above `OFFLINE` so the
/// two can never be confused.
const EPOCH_START: Epoch = 2;

struct ThreadState {
    local_epoch: CachePadded<Atomic<Epoch>>,
}

struct Shared {
    registry: Registry<ThreadState>,
    global_epoch: CachePadded<Atomic<Epoch>>,
}

/// A QSBR instance: owns the registry of participating threads and the
/// global epoch counter. Cheaply `Clone`able (an `Arc` underneath); every
/// clone refers to the same instance.
#[derive(Clone)]
pub struct Qsbr {
    shared: Arc<Shared>,
}

impl Default for Qsbr {
    fn default() -> Self {
        Self::new()
    }
}

impl Qsbr {
    /// Create a new instance. Infallible on stable Rust (see
    /// [`SmrError::OutOfMemory`]); kept fallible in the signature to match
    /// a record-allocation contract.
    pub fn new() -> Self {
        Qsbr {
            shared: Arc::new(Shared {
                registry: Registry::new(),
                global_epoch: CachePadded::new(Atomic::new(EPOCH_START)),
            }),
        }
    }

    /// Register the calling thread, allocating and linking its record.
    pub fn register(&self) -> Result<QsbrHandle, SmrError> {
        let slot = self.shared.registry.insert(ThreadState {
            local_epoch: CachePadded::new(Atomic::new(OFFLINE)),
        });
        tracing::trace!("qsbr thread registered");
        Ok(QsbrHandle {
            collector: self.clone(),
            slot,
        })
    }

    /// Atomically increment the global epoch and return the new value.
    pub fn barrier(&self) -> Epoch {
        let new_epoch = self.shared.global_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(new_epoch, "qsbr barrier");
        new_epoch
    }

    fn current_epoch(&self) -> Epoch {
        self.shared.global_epoch.load(Ordering::Acquire)
    }

    /// Scan every registered thread (no self-checkpoint performed here;
    /// see [`QsbrHandle::sync`] for the reader-participating version).
    /// Returns `true` iff every thread is offline or at/after `target`.
    fn sync_registry(&self, target: Epoch) -> bool {
        self.shared.registry.iter().all(|state| {
            let local = state.local_epoch.load(Ordering::Acquire);
            local == OFFLINE || crate::epoch_width::epoch_ge(local, target)
        })
    }
}

/// A registered thread's handle onto a [`Qsbr`] instance. Not `Sync`: a
/// handle is owned and driven by exactly one thread, and a thread's local
/// epoch is only ever written by that thread.
pub struct QsbrHandle {
    collector: Qsbr,
    slot: Slot<ThreadState>,
}

impl QsbrHandle {
    fn state(&self) -> &ThreadState {
        // SAFETY: `slot` is this handle's own, not yet unregistered.
        unsafe { self.collector.shared.registry.data(self.slot) }
    }

    /// Publish "I hold no protected references right now": release before
    /// the store, acquire after.
    pub fn checkpoint(&self) {
        let epoch = self.collector.current_epoch();
        std::sync::atomic::fence(Ordering::Release);
        self.state().local_epoch.store(epoch, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Acquire);
    }

    /// Declare an extended quiescent state: writers stop waiting on this
    /// thread until [`thread_online`](Self::thread_online) is called.
    pub fn thread_offline(&self) {
        std::sync::atomic::fence(Ordering::Release);
        self.state().local_epoch.store(OFFLINE, Ordering::Relaxed);
    }

    /// Re-publish the current global epoch after having been offline.
    pub fn thread_online(&self) {
        let epoch = self.collector.current_epoch();
        self.state().local_epoch.store(epoch, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Acquire);
    }

    /// Atomically increment the global epoch and return the new value.
    pub fn barrier(&self) -> Epoch {
        self.collector.barrier()
    }

    /// Checkpoint the caller, then scan the registry: `true` iff every
    /// registered thread is offline or at/after `target`.
    pub fn sync(&self, target: Epoch) -> bool {
        self.checkpoint();
        self.collector.sync_registry(target)
    }

    /// Barrier, then poll `sync` until the resulting grace period has
    /// elapsed, sleeping `poll_interval` between attempts. Returns the
    /// epoch the grace period was established at.
    pub fn wait(&self, poll_interval: Duration) -> Epoch {
        let target = self.barrier();
        while !self.sync(target) {
            std::thread::sleep(poll_interval);
        }
        target
    }

    /// The instance this handle is registered against.
    pub fn collector(&self) -> &Qsbr {
        &self.collector
    }
}

impl Drop for QsbrHandle {
    fn drop(&mut self) {
        // Satisfy the unregister precondition (offline, or a final
        // checkpoint published) automatically: a handle going out of
        // scope means the thread is done.
        self.thread_offline();
        // SAFETY: this thread owns `slot` and is the only one ever
        // allowed to remove it; it is not in a critical section (QSBR has
        // none) and has just gone offline, satisfying the registry-removal
        // precondition.
        unsafe { self.collector.shared.registry.remove(self.slot) };
        tracing::trace!("qsbr thread unregistered");
    }
}

impl SmrBackend for QsbrHandle {
    fn staging_epoch(&self) -> Epoch {
        // QSBR tags a newly retired pointer with the barrier that follows
        // its retirement.
        self.barrier()
    }

    fn is_safe(&self, tag: Epoch) -> bool {
        self.sync(tag)
    }

    fn advance(&self) -> Epoch {
        self.barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_utils::thread::scope;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::AtomicUsize as Counter;

    #[test]
    fn sync_trivially_true_with_no_other_threads() {
        let qsbr = Qsbr::new();
        let h = qsbr.register().unwrap();
        let target = h.barrier();
        assert!(h.sync(target));
    }

    #[test]
    fn offline_threads_never_block_sync() {
        let qsbr = Qsbr::new();
        let writer = qsbr.register().unwrap();
        let idle = qsbr.register().unwrap();
        idle.thread_offline();

        let target = writer.barrier();
        assert!(writer.sync(target));
    }

    /// S1 — a writer publishes a pointer, readers hold it across their
    /// critical section (load, then use, then checkpoint), and the writer
    /// only frees the old allocation after `wait` reports the grace period
    /// has elapsed. No reader should ever read back a poisoned value.
    #[test]
    fn grace_period_protects_readers() {
        use std::sync::atomic::AtomicPtr;

        const LIVE: usize = 0x5a5a_5a5a;
        const POISON: usize = 0xdead_beef;

        let qsbr = Qsbr::new();
        let slot: Arc<AtomicPtr<AtomicUsize>> =
            Arc::new(AtomicPtr::new(Box::into_raw(Box::new(AtomicUsize::new(LIVE)))));
        let stop = Arc::new(AtomicUsize::new(0));
        let saw_poison = Arc::new(Counter::new(0));

        scope(|s| {
            for _ in 0..3 {
                let reader = qsbr.register().unwrap();
                let slot = slot.clone();
                let stop = stop.clone();
                let saw_poison = saw_poison.clone();
                s.spawn(move |_| {
                    while stop.load(Ordering::Acquire) == 0 {
                        let ptr = slot.load(Ordering::Acquire);
                        if !ptr.is_null() {
                            // Held across the critical section: valid
                            // until this thread's next checkpoint.
                            let value = unsafe { (*ptr).load(Ordering::Relaxed) };
                            std::thread::yield_now();
                            if value == POISON {
                                saw_poison.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        reader.checkpoint();
                    }
                });
            }

            let writer = qsbr.register().unwrap();
            for _ in 0..20 {
                std::thread::yield_now();
            }

            let old = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            writer.wait(Duration::from_millis(1));
            // SAFETY: the grace period has elapsed; no reader can still
            // hold a reference obtained before the swap above.
            unsafe {
                (*old).store(POISON, Ordering::Relaxed);
                drop(Box::from_raw(old));
            }
            stop.store(1, Ordering::Release);
        })
        .unwrap();

        assert_eq!(saw_poison.load(Ordering::Relaxed), 0);
    }
}
