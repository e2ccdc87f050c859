//! Epoch-Based Reclamation.
//!
//! Readers bracket their critical sections with [`EbrHandle::enter`] /
//! [`EbrGuard::exit`] (or just let the returned [`EbrGuard`] drop). The
//! library rotates exactly three epoch slots; a writer can only advance
//! the global epoch once every active reader has been observed stamped
//! with the current one. That gives a three-generation pipeline —
//! *staging* (current, where new retirements are tagged), *incumbent*
//! (current + 1 mod 3, safe to reclaim — a tag only reaches this slot
//! after two real `sync` advances past it), *pending* (current + 2 mod 3,
//! the remaining slot, not yet retirable into and not yet safe) — named
//! by [`EbrHandle::staging_epoch`], [`EbrHandle::pending_epoch`], and
//! [`EbrHandle::incumbent_epoch`], a convention fixed once and used
//! consistently throughout.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use atomic::Atomic;
use crossbeam_utils::CachePadded;
use static_assertions::const_assert;

use crate::epoch_width::Epoch;
use crate::error::SmrError;
use crate::gc::SmrBackend;
use crate::registry::{Registry, Slot};

const_assert!(Atomic::<u64>::is_lock_free());

/// Low two bits of the packed slot word: the epoch (always 0, 1, or 2).
const EPOCH_MASK: u64 = 0b11;
/// Third bit of the packed slot word: set while the thread is active.
const ACTIVE_BIT: u64 = 1 << 2;

fn pack(epoch: Epoch, active: bool) -> u64 {
    let epoch = epoch as u64 & EPOCH_MASK;
    if active {
        epoch | ACTIVE_BIT
    } else {
        epoch
    }
}

struct ThreadState {
    /// Packed (active, epoch) word, written only by the owning thread
    /// (other than its initial publication), read by any writer's `sync`.
    slot: CachePadded<Atomic<u64>>,
    /// Re-entrancy depth for nested `enter`/`exit`. Touched only by the
    /// owning thread, so plain relaxed loads/stores suffice.
    nesting: CachePadded<Atomic<u32>>,
}

struct Shared {
    registry: Registry<ThreadState>,
    global_epoch: CachePadded<Atomic<Epoch>>,
}

/// An EBR instance. Cheaply `Clone`-able; every clone refers to the same
/// instance.
#[derive(Clone)]
pub struct Ebr {
    shared: Arc<Shared>,
}

impl Default for Ebr {
    fn default() -> Self {
        Self::new()
    }
}

impl Ebr {
    /// Create a new instance. Infallible on stable Rust; see
    /// [`SmrError::OutOfMemory`].
    pub fn new() -> Self {
        Ebr {
            shared: Arc::new(Shared {
                registry: Registry::new(),
                global_epoch: CachePadded::new(Atomic::new(0)),
            }),
        }
    }

    /// Register the calling thread, allocating and linking its record.
    pub fn register(&self) -> Result<EbrHandle, SmrError> {
        let slot = self.shared.registry.insert(ThreadState {
            slot: CachePadded::new(Atomic::new(pack(0, false))),
            nesting: CachePadded::new(Atomic::new(0)),
        });
        tracing::trace!("ebr thread registered");
        Ok(EbrHandle {
            collector: self.clone(),
            slot,
        })
    }

    fn current(&self) -> Epoch {
        self.shared.global_epoch.load(Ordering::Acquire)
    }
}

/// A registered thread's handle onto an [`Ebr`] instance. Not `Sync`: a
/// handle is driven by exactly one thread.
pub struct EbrHandle {
    collector: Ebr,
    slot: Slot<ThreadState>,
}

impl EbrHandle {
    fn state(&self) -> &ThreadState {
        // SAFETY: `slot` is this handle's own, not yet unregistered.
        unsafe { self.collector.shared.registry.data(self.slot) }
    }

    /// Enter a (possibly nested) critical section. Only the outermost
    /// `enter` publishes; returns a guard whose `Drop` calls `exit`.
    pub fn enter(&self) -> EbrGuard<'_> {
        let state = self.state();
        let depth = state.nesting.load(Ordering::Relaxed);
        if depth == 0 {
            let epoch = self.collector.current();
            state.slot.store(pack(epoch, true), Ordering::Release);
        }
        state.nesting.store(depth + 1, Ordering::Relaxed);
        EbrGuard { handle: self }
    }

    fn exit(&self) {
        let state = self.state();
        let depth = state.nesting.load(Ordering::Relaxed);
        debug_assert!(depth > 0, "EBR exit without a matching enter");
        state.nesting.store(depth - 1, Ordering::Relaxed);
        if depth == 1 {
            state.slot.store(0, Ordering::Release);
        }
    }

    /// Examine every registered thread; if every active one is stamped
    /// with the current epoch, advance the global epoch (mod 3) and
    /// report the new value through `out_epoch`. Returns `true` iff it
    /// advanced. The only function that advances the epoch.
    pub fn sync(&self, out_epoch: &mut Epoch) -> bool {
        let current = self.collector.current();
        let all_caught_up = self.collector.shared.registry.iter().all(|state| {
            let word = state.slot.load(Ordering::Acquire);
            let active = word & ACTIVE_BIT != 0;
            let epoch = word & EPOCH_MASK;
            !active || epoch == current
        });
        if !all_caught_up {
            return false;
        }

        let new_epoch = (current + 1) % 3;
        match self.collector.shared.global_epoch.compare_exchange(
            current,
            new_epoch,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::trace!(new_epoch, "ebr epoch advanced");
                *out_epoch = new_epoch;
                true
            }
            Err(_) => false,
        }
    }

    /// The epoch newly retired objects should be tagged with.
    pub fn staging_epoch(&self) -> Epoch {
        self.collector.current()
    }

    /// The slot that will become safe to retire into next.
    pub fn pending_epoch(&self) -> Epoch {
        (self.collector.current() + 2) % 3
    }

    /// The slot whose objects are now reclaimable. Two full `sync` advances
    /// past an epoch are required before objects staged there land here —
    /// one advance only proves readers stamped at the old epoch have
    /// *started* to move on, not that they have exited; see
    /// `three_slot_rotation_reclaims_after_two_advances`.
    pub fn incumbent_epoch(&self) -> Epoch {
        (self.collector.current() + 1) % 3
    }

    /// The instance this handle is registered against.
    pub fn collector(&self) -> &Ebr {
        &self.collector
    }
}

impl Drop for EbrHandle {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.state().nesting.load(Ordering::Relaxed),
            0,
            "EBR handle dropped while still inside a critical section"
        );
        // SAFETY: this thread owns `slot`, has no active critical section
        // (asserted above), and is the only remover of its own record.
        unsafe { self.collector.shared.registry.remove(self.slot) };
        tracing::trace!("ebr thread unregistered");
    }
}

impl SmrBackend for EbrHandle {
    fn staging_epoch(&self) -> Epoch {
        EbrHandle::staging_epoch(self)
    }

    fn is_safe(&self, tag: Epoch) -> bool {
        tag == self.incumbent_epoch()
    }

    fn advance(&self) -> Epoch {
        let mut out = self.staging_epoch();
        self.sync(&mut out);
        out
    }
}

/// RAII guard for a critical section entered via [`EbrHandle::enter`].
/// Calls [`EbrHandle::exit`] on drop.
pub struct EbrGuard<'h> {
    handle: &'h EbrHandle,
}

impl Drop for EbrGuard<'_> {
    fn drop(&mut self) {
        self.handle.exit();
    }
}
