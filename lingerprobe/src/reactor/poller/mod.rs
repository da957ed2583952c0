//! Platform-specific I/O poller abstraction.
//!
//! The poller is used by the reactor to:
//! - wait for readiness of descriptors that in-flight operations wait on,
//! - wake the reactor thread when it must stop,
//! - expose the raw socket syscalls the operations are built from.
//!
//! Only the Linux `epoll` backend exists; completion semantics are
//! emulated on top of it by the reactor.

pub(crate) mod common;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub(crate) use epoll::Events;

#[cfg(target_os = "linux")]
pub(crate) type Poller = epoll::EpollPoller;

#[cfg(target_os = "linux")]
pub(crate) mod unix;

#[cfg(target_os = "linux")]
pub(crate) use unix as platform;

#[cfg(not(target_os = "linux"))]
compile_error!("lingerprobe emulates completion I/O on top of epoll and only builds on Linux");
