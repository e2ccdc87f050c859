//! Error taxonomy.
//!
//! Out-of-memory is the only recoverable error this crate surfaces.
//! Contract violations (calling `checkpoint`/`enter`/`exit` on an
//! unregistered handle, mismatched `enter`/`exit` nesting) are programming
//! errors and fail hard via `debug_assert!` rather than being added to
//! this enum. "Grace period not yet elapsed" is reported as a plain
//! `bool`, never as an `Err`.

use thiserror::Error;

/// Errors this crate can return.
#[derive(Debug, Error)]
pub enum SmrError {
    /// Allocating an instance or a thread's registration record failed.
    ///
    /// Stable Rust's global allocator aborts the process on allocation
    /// failure rather than returning a catchable error, so this variant is
    /// not currently reachable; it exists so the public API matches the
    /// spec's error taxonomy and so a future fallible-allocation path has
    /// somewhere to report to without a breaking change.
    #[error("failed to allocate a thread registration record")]
    OutOfMemory,
}
