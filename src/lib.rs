//! Safe memory reclamation primitives: QSBR, EBR, and a deferred
//! reclamation queue layered on either.
//!
//! - [`qsbr`] — quiescent-state-based reclamation: readers periodically
//!   declare they hold no protected references.
//! - [`ebr`] — epoch-based reclamation: readers bracket critical sections
//!   with an RAII guard.
//! - [`gc`] — a FIFO retirement queue generic over either backend via
//!   [`gc::SmrBackend`].
//!
//! Both backends expose the same shape: `register` a thread, get back a
//! handle, drive the handle from that one thread, `Drop` the handle when
//! the thread is done.

pub mod ebr;
pub mod epoch_width;
pub mod error;
pub mod gc;
pub mod qsbr;
mod registry;

pub use ebr::{Ebr, EbrGuard, EbrHandle};
pub use epoch_width::Epoch;
pub use error::SmrError;
pub use gc::{Gc, SmrBackend, DEFAULT_POLL_INTERVAL};
pub use qsbr::{Qsbr, QsbrHandle};
