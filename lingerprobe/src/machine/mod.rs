//! Server and client state machines.
//!
//! Each machine owns its sockets and is the only thing that mutates its
//! state. Completions never touch a machine directly: the reactor posts them
//! to the machine's [`Port`], and the machine's own loop dispatches them.

mod client;
mod server;

pub use client::{Client, ClientState};
pub use server::{Server, ServerState};

use crate::error::Result;
use crate::net::Socket;
use crate::observe::{Event, Observer, Role};
use crate::reactor::{
    CancelOutcome, Completion, Issued, Ledger, OpContext, OpId, OpKind, ReactorHandle, Sink,
};

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::time::{Duration, Instant};

/// A role's completion port.
///
/// Bundles what a machine needs to issue operations: the reactor, the
/// context ledger, the observer and the channel completions come back on.
/// Completions of operations that finished while being issued are queued
/// here too, so they are dispatched by the same loop as everything else.
pub struct Port {
    role: Role,
    reactor: ReactorHandle,
    ledger: Arc<Ledger>,
    observer: Arc<dyn Observer>,
    sink: Sink,
    inbox: Receiver<Completion>,
    inline: VecDeque<Completion>,
}

impl Port {
    pub fn new(
        role: Role,
        reactor: ReactorHandle,
        ledger: Arc<Ledger>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let (sink, inbox) = channel();

        Self {
            role,
            reactor,
            ledger,
            observer,
            sink,
            inbox,
            inline: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn observe(&self, event: Event) {
        self.observer.observe(self.role, &event);
    }

    /// Routes completions of operations on `socket` to this port.
    pub(crate) fn bind(&self, socket: &Socket) -> Result<()> {
        self.reactor.bind(socket.raw(), self.sink.clone())
    }

    /// Stops routing completions for the descriptor `fd`.
    pub(crate) fn unbind(&self, fd: RawFd) {
        self.reactor.unbind(fd);
    }

    pub(crate) fn allocate(&self, kind: OpKind, socket: &Socket) -> Result<Box<OpContext>> {
        self.ledger.allocate(kind, socket.raw())
    }

    /// Issues `ctx` and returns its id.
    ///
    /// An inline completion is queued and dispatched on the next
    /// [`StateMachine::pump`].
    pub(crate) fn submit(&mut self, ctx: Box<OpContext>) -> OpId {
        let (kind, socket) = (ctx.kind(), ctx.socket());

        match self.reactor.submit(ctx) {
            Issued::Completed(completion) => {
                let id = completion.id();
                self.inline.push_back(completion);
                id
            }
            Issued::Pending(id) => {
                self.observe(Event::Pending { kind, socket });
                id
            }
        }
    }

    /// Cancels everything in flight on `socket`.
    pub(crate) fn cancel(&self, socket: &Socket) -> CancelOutcome {
        let outcome = self.reactor.cancel(socket.raw());
        self.observe(Event::Cancelled {
            socket: socket.raw(),
            outcome,
        });
        outcome
    }

    /// Next completion to dispatch, waiting at most `wait` for one.
    fn next(&mut self, wait: Duration) -> Option<Completion> {
        if let Some(completion) = self.inline.pop_front() {
            return Some(completion);
        }

        if wait.is_zero() {
            return self.inbox.try_recv().ok();
        }

        match self.inbox.recv_timeout(wait) {
            Ok(completion) => Some(completion),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// A role's state machine.
pub trait StateMachine {
    fn port(&mut self) -> &mut Port;

    /// One-time setup run by the driver before the first tick.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handles one completion. Consumes it, freeing its context.
    fn dispatch(&mut self, completion: Completion) -> Result<()>;

    /// Performs at most one state-advancing operation.
    fn step(&mut self) -> Result<()>;

    /// Cancels outstanding work and releases every socket.
    ///
    /// Calling it again once everything is released is a no-op.
    fn teardown(&mut self) -> Result<()>;

    /// Short human-readable name of the current state.
    fn describe(&self) -> String;

    /// Dispatches completions as they arrive for `wait`, then returns the
    /// number handled.
    ///
    /// With a zero `wait`, only what is already queued is dispatched.
    fn pump(&mut self, wait: Duration) -> Result<usize> {
        let deadline = Instant::now() + wait;
        let mut handled = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            match self.port().next(remaining) {
                Some(completion) => {
                    self.dispatch(completion)?;
                    handled += 1;
                }
                None => return Ok(handled),
            }
        }
    }

    /// Dispatches whatever is already queued.
    fn settle(&mut self) -> Result<usize> {
        self.pump(Duration::ZERO)
    }
}
