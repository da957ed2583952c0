/// An I/O event reported by the poller.
///
/// An `Event` represents readiness information for a registered
/// file descriptor. It is produced by the poller and consumed
/// by the reactor to re-attempt the in-flight operation it belongs to.
///
/// Error and hang-up conditions are reported as both readable and
/// writable, so they satisfy whichever interest the operation waits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Event {
    /// Token associated with the registered file descriptor.
    ///
    /// This is the slab index of the in-flight operation.
    pub(crate) token: usize,

    /// Indicates that the file descriptor is readable.
    pub(crate) readable: bool,

    /// Indicates that the file descriptor is writable.
    pub(crate) writable: bool,
}

impl Event {
    /// Returns `true` if this event satisfies `interest`.
    pub(crate) fn satisfies(&self, interest: super::poller::common::Interest) -> bool {
        (interest.read && self.readable) || (interest.write && self.writable)
    }
}
