//! # lingerprobe
//!
//! **lingerprobe** is a loopback TCP client/server rig for observing
//! connection lifecycle edge cases: abrupt close, linger, and the races
//! between accept and connect.
//!
//! Both roles drive single-slot state machines on top of completion-based
//! socket I/O:
//!
//! - The **server** owns one listening socket, at most one pending accept and
//!   at most one accepted connection, which it reads in a loop.
//! - The **client** owns at most one outbound connection and sends numbered
//!   `MSG <n>` messages over it, one at a time.
//!
//! Every operation is described by an operation context that is handed back,
//! exactly once, in a completion. Completions are posted to the owning role's
//! port and dispatched by that role's own loop, so no machine state is ever
//! touched from another thread.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lingerprobe::EngineBuilder;
//! use std::time::Duration;
//!
//! let handle = EngineBuilder::new()
//!     .client_tick(Duration::from_millis(100))
//!     .message_limit(3)
//!     .build()
//!     .start()
//!     .unwrap();
//!
//! std::thread::sleep(Duration::from_secs(1));
//! handle.stop();
//!
//! let report = handle.join();
//! assert!(report.is_success());
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: configuration, the liveness flag and the role threads
//! - [`machine`]: the server and client state machines
//! - [`reactor`]: operation contexts, completions and the reactor thread
//! - [`observe`]: the event sink
//! - [`net`]: socket handles

mod error;
mod utils;

pub mod engine;
pub mod machine;
pub mod net;
pub mod observe;
pub mod reactor;

pub use engine::{Config, Engine, EngineBuilder, EngineHandle, Liveness, Report, SendFailurePolicy};
pub use error::{Error, Result};
pub use observe::{Event, LogObserver, Observer, Recorder, Role, describe_error};
