//! Completion-based socket I/O.
//!
//! The reactor turns readiness notifications into completions: callers hand
//! it an [`OpContext`], and get the context back exactly once inside a
//! [`Completion`], either immediately (inline) or later through the sink
//! bound to the operation's socket.
//!
//! Components:
//! - [`op`]: operation contexts and the allocation [`Ledger`],
//! - `core`: the reactor thread, submission and cancellation,
//! - `poller`: the `epoll` backend and raw socket syscalls.

mod core;
mod event;

pub mod op;
pub(crate) mod poller;

pub use core::{CancelOutcome, Reactor, ReactorHandle};
pub(crate) use core::{Issued, Sink};
pub use op::{Completion, Ledger, LedgerStats, OpContext, OpId, OpKind, SCRATCH_LEN};
