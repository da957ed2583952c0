use super::event::Event;
use super::op::{Completion, OpContext, OpId, OpKind};
use super::poller::common::Interest;
use super::poller::platform::{
    sys_accept, sys_close, sys_connect, sys_dup_onto, sys_peername, sys_recv, sys_send,
    sys_shutdown, sys_take_socket_error,
};
use super::poller::{Events, Poller};
use crate::error::{Error, Result};
use crate::utils::Slab;

use std::collections::HashMap;
use std::io;
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Where completions for a socket are delivered.
pub(crate) type Sink = Sender<Completion>;

/// Outcome of [`ReactorHandle::submit`].
#[derive(Debug)]
pub(crate) enum Issued {
    /// The operation finished on the issuing thread.
    Completed(Completion),
    /// The reactor now owns the context and will deliver it to the sink.
    Pending(OpId),
}

/// Outcome of [`ReactorHandle::cancel`].
///
/// Neither outcome is an error: cancelled operations are acknowledged later,
/// when their completions arrive with `ECANCELED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(usize),
    NotFound,
}

/// Result of attempting an operation once.
enum Progress {
    Done(io::Result<usize>),
    Wait(Interest),
}

/// An operation parked until its descriptor becomes ready.
struct InFlight {
    ctx: Box<OpContext>,
    wait_fd: RawFd,
    interest: Interest,
}

struct Registry {
    /// In-flight operations, indexed by poller token.
    ops: Slab<InFlight>,

    /// Token of the operation waiting on each descriptor.
    waiting: HashMap<RawFd, usize>,

    /// Completion sink bound to each socket.
    sinks: HashMap<RawFd, Sink>,

    /// Set once the reactor stopped accepting work.
    closed: bool,
}

struct Inner {
    poller: Poller,
    registry: Mutex<Registry>,
    shutdown: AtomicBool,
}

/// The reactor.
///
/// The reactor emulates completion-based socket I/O on top of readiness
/// polling. Every operation is attempted on the submitting thread first;
/// operations that would block are parked and re-attempted by a dedicated
/// thread when their descriptor becomes ready, and the finished
/// [`Completion`] is posted to the sink bound to the operation's socket.
///
/// Dropping the reactor shuts it down.
pub struct Reactor {
    handle: ReactorHandle,
    thread: Option<JoinHandle<()>>,
}

/// A handle used to submit and cancel operations.
///
/// Cloning this handle allows both roles to share one reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    inner: Arc<Inner>,
}

impl Reactor {
    /// Creates the poller and starts the reactor thread.
    pub fn start() -> Result<Self> {
        let poller = Poller::new().map_err(Error::setup("poller"))?;

        let inner = Arc::new(Inner {
            poller,
            registry: Mutex::new(Registry {
                ops: Slab::new(16),
                waiting: HashMap::new(),
                sinks: HashMap::new(),
                closed: false,
            }),
            shutdown: AtomicBool::new(false),
        });

        let thread = thread::Builder::new()
            .name("lingerprobe-reactor".into())
            .spawn({
                let inner = inner.clone();
                move || run(&inner)
            })
            .map_err(Error::setup("reactor thread"))?;

        Ok(Self {
            handle: ReactorHandle { inner },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Stops the reactor thread and fails every operation still in flight.
    ///
    /// Remaining operations are delivered with `ECANCELED`; if their sink is
    /// gone the context is simply freed. Calling this twice is a no-op.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        let inner = &self.handle.inner;
        inner.shutdown.store(true, Ordering::Release);
        inner.poller.waker().wake();

        if thread.join().is_err() {
            log::error!(target: "lingerprobe::reactor", "reactor thread panicked");
        }

        let cancelled = {
            let mut registry = inner.registry.lock().unwrap();
            registry.closed = true;

            let tokens: Vec<usize> = registry.ops.iter().map(|(token, _)| token).collect();
            let cancelled = registry.cancel_all(&inner.poller, tokens);

            registry.sinks.clear();
            cancelled
        };

        deliver(cancelled);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ReactorHandle {
    /// Binds `fd` to a completion sink.
    ///
    /// Completions of operations on `fd` are posted to `sink`. Rebinding a
    /// descriptor replaces its sink.
    pub(crate) fn bind(&self, fd: RawFd, sink: Sink) -> Result<()> {
        let mut registry = self.inner.registry.lock().unwrap();

        if registry.closed {
            return Err(Error::PortClosed);
        }

        registry.sinks.insert(fd, sink);
        Ok(())
    }

    /// Forgets the sink bound to `fd`.
    ///
    /// Called before the socket is closed so that a reused descriptor
    /// number never inherits an old route.
    pub(crate) fn unbind(&self, fd: RawFd) {
        self.inner.registry.lock().unwrap().sinks.remove(&fd);
    }

    /// Issues an operation.
    ///
    /// The operation is attempted immediately. If it cannot finish without
    /// blocking, ownership of the context moves into the reactor until the
    /// operation completes or is cancelled.
    pub(crate) fn submit(&self, mut ctx: Box<OpContext>) -> Issued {
        let mut registry = self.inner.registry.lock().unwrap();

        if registry.closed {
            return Issued::Completed(Completion::failed(ctx, libc::ECANCELED, true));
        }

        let wait_fd = ctx.wait_fd();
        if registry.waiting.contains_key(&wait_fd) {
            return Issued::Completed(Completion::failed(ctx, libc::EALREADY, true));
        }

        let interest = match perform(&mut ctx) {
            Progress::Done(result) => return Issued::Completed(Completion::new(ctx, result, true)),
            Progress::Wait(interest) => interest,
        };

        let id = ctx.id();
        let token = registry.ops.insert(InFlight {
            ctx,
            wait_fd,
            interest,
        });

        if let Err(err) = self.inner.poller.register(wait_fd, token, interest) {
            return match registry.ops.remove(token) {
                Some(op) => Issued::Completed(Completion::new(op.ctx, Err(err), true)),
                None => Issued::Pending(id),
            };
        }

        registry.waiting.insert(wait_fd, token);
        Issued::Pending(id)
    }

    /// Cancels every in-flight operation on `fd`.
    ///
    /// Matches operations whose socket is `fd` as well as accepts waiting on
    /// a listener `fd`. Cancelled contexts are delivered to their sinks with
    /// `ECANCELED`.
    pub(crate) fn cancel(&self, fd: RawFd) -> CancelOutcome {
        let cancelled = {
            let mut registry = self.inner.registry.lock().unwrap();

            let tokens: Vec<usize> = registry
                .ops
                .iter()
                .filter(|(_, op)| op.ctx.socket() == fd || op.wait_fd == fd)
                .map(|(token, _)| token)
                .collect();

            registry.cancel_all(&self.inner.poller, tokens)
        };

        if cancelled.is_empty() {
            return CancelOutcome::NotFound;
        }

        let n = cancelled.len();
        deliver(cancelled);
        CancelOutcome::Cancelled(n)
    }

    /// Number of operations currently parked in the reactor.
    pub fn in_flight(&self) -> usize {
        self.inner.registry.lock().unwrap().ops.len()
    }

    /// Number of sockets currently bound to a completion sink.
    pub fn bound_sockets(&self) -> usize {
        self.inner.registry.lock().unwrap().sinks.len()
    }
}

impl Registry {
    /// Removes an in-flight operation and disarms its descriptor.
    fn retire(&mut self, poller: &Poller, token: usize) -> Option<Box<OpContext>> {
        let op = self.ops.remove(token)?;

        self.waiting.remove(&op.wait_fd);
        poller.deregister(op.wait_fd);

        Some(op.ctx)
    }

    /// Retires `tokens`, failing each operation with `ECANCELED`.
    fn cancel_all(&mut self, poller: &Poller, tokens: Vec<usize>) -> Vec<(Option<Sink>, Completion)> {
        let mut cancelled = Vec::with_capacity(tokens.len());

        for token in tokens {
            if let Some(ctx) = self.retire(poller, token) {
                cancelled.push(self.route(Completion::failed(ctx, libc::ECANCELED, false)));
            }
        }

        cancelled
    }

    /// Pairs a completion with the sink bound to its socket.
    fn route(&self, completion: Completion) -> (Option<Sink>, Completion) {
        (self.sinks.get(&completion.socket()).cloned(), completion)
    }

    /// Re-attempts the operation behind `event`.
    fn handle_event(&mut self, poller: &Poller, event: Event) -> Option<(Option<Sink>, Completion)> {
        let op = self.ops.get_mut(event.token)?;

        let progress = if event.satisfies(op.interest) {
            perform(&mut op.ctx)
        } else {
            Progress::Wait(op.interest)
        };

        let result = match progress {
            Progress::Wait(interest) => {
                op.interest = interest;
                match poller.rearm(op.wait_fd, event.token, interest) {
                    Ok(()) => return None,
                    Err(err) => Err(err),
                }
            }
            Progress::Done(result) => result,
        };

        let ctx = self.retire(poller, event.token)?;
        Some(self.route(Completion::new(ctx, result, false)))
    }
}

/// Posts completions outside of the registry lock.
///
/// A completion whose sink is missing or disconnected is dropped, which
/// frees its context.
fn deliver(completions: Vec<(Option<Sink>, Completion)>) {
    for (sink, completion) in completions {
        let id = completion.id();

        let undelivered = match sink {
            Some(sink) => sink.send(completion).is_err(),
            None => true,
        };

        if undelivered {
            log::debug!(target: "lingerprobe::reactor", "dropping completion {id}: nobody is listening");
        }
    }
}

/// Main reactor loop.
///
/// Each turn polls for readiness, re-attempts the operations that became
/// ready, and delivers the finished ones.
fn run(inner: &Inner) {
    let mut buffer = Events::with_capacity(64);
    let mut events = Vec::with_capacity(64);

    while !inner.shutdown.load(Ordering::Acquire) {
        if let Err(err) = inner.poller.poll(&mut buffer, &mut events, None) {
            log::error!(target: "lingerprobe::reactor", "poll failed: {err}");
            break;
        }

        let ready: Vec<_> = {
            let mut registry = inner.registry.lock().unwrap();
            events
                .drain(..)
                .filter_map(|event| registry.handle_event(&inner.poller, event))
                .collect()
        };

        deliver(ready);
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Attempts `ctx` without blocking.
fn perform(ctx: &mut OpContext) -> Progress {
    match ctx.kind() {
        OpKind::Accept => perform_accept(ctx),
        OpKind::Receive => perform_receive(ctx),
        OpKind::Send => perform_send(ctx),
        OpKind::Connect => perform_connect(ctx),
        OpKind::Disconnect => perform_disconnect(ctx),
    }
}

/// Accepts on the listener and moves the connection onto the context socket.
fn perform_accept(ctx: &mut OpContext) -> Progress {
    let (fd, peer) = match sys_accept(ctx.wait_fd()) {
        Ok(accepted) => accepted,
        Err(err) if would_block(&err) => return Progress::Wait(Interest::READ),
        Err(err) => return Progress::Done(Err(err)),
    };

    let moved = sys_dup_onto(fd, ctx.socket());
    sys_close(fd);

    Progress::Done(moved.map(|()| {
        ctx.set_peer(peer);
        0
    }))
}

fn perform_receive(ctx: &mut OpContext) -> Progress {
    let socket = ctx.socket();

    match sys_recv(socket, ctx.scratch()) {
        Ok(n) => {
            ctx.set_len(n);
            Progress::Done(Ok(n))
        }
        Err(err) if would_block(&err) => Progress::Wait(Interest::READ),
        Err(err) => Progress::Done(Err(err)),
    }
}

fn perform_send(ctx: &mut OpContext) -> Progress {
    while !ctx.unsent().is_empty() {
        match sys_send(ctx.socket(), ctx.unsent()) {
            Ok(n) => ctx.advance(n),
            Err(err) if would_block(&err) => return Progress::Wait(Interest::WRITE),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Progress::Done(Err(err)),
        }
    }

    Progress::Done(Ok(ctx.len()))
}

fn perform_connect(ctx: &mut OpContext) -> Progress {
    if ctx.start() {
        let Some(peer) = ctx.peer() else {
            return Progress::Done(Err(io::Error::from_raw_os_error(libc::EDESTADDRREQ)));
        };

        return match sys_connect(ctx.socket(), &peer) {
            Ok(()) => Progress::Done(Ok(0)),
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
                Progress::Wait(Interest::WRITE)
            }
            Err(err) => Progress::Done(Err(err)),
        };
    }

    match sys_take_socket_error(ctx.socket()) {
        Ok(Some(err)) | Err(err) => return Progress::Done(Err(err)),
        Ok(None) => {}
    }

    // A stale wake-up leaves the socket writable-but-unconnected.
    match sys_peername(ctx.socket()) {
        Ok(_) => Progress::Done(Ok(0)),
        Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => Progress::Wait(Interest::WRITE),
        Err(err) => Progress::Done(Err(err)),
    }
}

/// Half-closes the socket, then drains it until the peer closes too.
fn perform_disconnect(ctx: &mut OpContext) -> Progress {
    let socket = ctx.socket();

    if ctx.start() {
        if let Err(err) = sys_shutdown(socket, Shutdown::Write) {
            return Progress::Done(Err(err));
        }
    }

    loop {
        match sys_recv(socket, ctx.scratch()) {
            Ok(0) => return Progress::Done(Ok(0)),
            Ok(_) => {}
            Err(err) if would_block(&err) => return Progress::Wait(Interest::READ),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Progress::Done(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Socket;
    use crate::reactor::op::Ledger;

    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::mpsc::{Receiver, channel};
    use std::time::Duration;

    /// A loopback listener plus a fresh socket to accept onto, both bound to `sink`.
    fn listener_and_pending(handle: &ReactorHandle, sink: &Sink) -> (Socket, Socket) {
        let listener = Socket::tcp_v4().unwrap();
        listener
            .bind(&SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .unwrap();
        listener.listen(16).unwrap();

        let pending = Socket::with_protocol_of(&listener).unwrap();
        handle.bind(pending.raw(), sink.clone()).unwrap();

        (listener, pending)
    }

    fn submit_accept(
        handle: &ReactorHandle,
        ledger: &Arc<Ledger>,
        listener: &Socket,
        pending: &Socket,
    ) -> OpId {
        let accept = ledger
            .allocate(OpKind::Accept, pending.raw())
            .unwrap()
            .with_listener(listener.raw());

        match handle.submit(accept) {
            Issued::Pending(id) => id,
            Issued::Completed(c) => panic!("accept should wait for a connection: {c:?}"),
        }
    }

    fn next(rx: &Receiver<Completion>) -> Completion {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn error_code(completion: &Completion) -> Option<i32> {
        completion.result().as_ref().err().and_then(|e| e.raw_os_error())
    }

    #[test]
    fn test_accept_then_receive_completes_through_sink() {
        let mut reactor = Reactor::start().unwrap();
        let handle = reactor.handle();
        let ledger = Ledger::new(None);
        let (tx, rx) = channel();
        let (listener, server) = listener_and_pending(&handle, &tx);

        let accept = submit_accept(&handle, &ledger, &listener, &server);

        let client = Socket::tcp_v4().unwrap();
        let _ = sys_connect(client.raw(), &listener.local_addr().unwrap());

        let completion = next(&rx);
        assert_eq!(completion.id(), accept);
        assert!(completion.result().is_ok());
        let (ctx, _, _) = completion.into_parts();
        assert_eq!(ctx.peer(), Some(client.local_addr().unwrap()));
        drop(ctx);

        let recv = ledger.allocate(OpKind::Receive, server.raw()).unwrap();
        let id = match handle.submit(recv) {
            Issued::Pending(id) => id,
            Issued::Completed(c) => panic!("nothing was sent yet: {c:?}"),
        };
        assert_eq!(handle.in_flight(), 1);

        sys_send(client.raw(), b"hello").unwrap();
        let completion = next(&rx);
        assert_eq!(completion.id(), id);
        assert!(!completion.is_inline());

        let (ctx, result, _) = completion.into_parts();
        assert_eq!(result.unwrap(), 5);
        assert_eq!(ctx.bytes(), b"hello");
        drop(ctx);

        reactor.shutdown();
        assert!(ledger.stats().is_balanced());
    }

    #[test]
    fn test_second_operation_on_same_descriptor_is_rejected() {
        let reactor = Reactor::start().unwrap();
        let handle = reactor.handle();
        let ledger = Ledger::new(None);
        let (tx, _rx) = channel();
        let (listener, first) = listener_and_pending(&handle, &tx);
        let second = Socket::with_protocol_of(&listener).unwrap();
        handle.bind(second.raw(), tx.clone()).unwrap();

        submit_accept(&handle, &ledger, &listener, &first);

        let again = ledger
            .allocate(OpKind::Accept, second.raw())
            .unwrap()
            .with_listener(listener.raw());
        match handle.submit(again) {
            Issued::Completed(c) => {
                assert_eq!(error_code(&c), Some(libc::EALREADY));
                assert!(c.is_inline());
            }
            Issued::Pending(_) => panic!("two operations waited on one descriptor"),
        }

        assert_eq!(handle.in_flight(), 1);
    }

    #[test]
    fn test_cancel_delivers_ecanceled_later() {
        let reactor = Reactor::start().unwrap();
        let handle = reactor.handle();
        let ledger = Ledger::new(None);
        let (tx, rx) = channel();
        let (listener, pending) = listener_and_pending(&handle, &tx);

        let id = submit_accept(&handle, &ledger, &listener, &pending);

        assert_eq!(handle.cancel(pending.raw()), CancelOutcome::Cancelled(1));
        assert_eq!(handle.cancel(pending.raw()), CancelOutcome::NotFound);
        assert_eq!(handle.in_flight(), 0);

        let completion = next(&rx);
        assert_eq!(completion.id(), id);
        assert_eq!(error_code(&completion), Some(libc::ECANCELED));
        drop(completion);

        assert!(ledger.stats().is_balanced());
    }

    #[test]
    fn test_unbind_drops_the_route() {
        let reactor = Reactor::start().unwrap();
        let handle = reactor.handle();
        let ledger = Ledger::new(None);
        let (tx, rx) = channel();
        let (listener, pending) = listener_and_pending(&handle, &tx);
        assert_eq!(handle.bound_sockets(), 1);

        submit_accept(&handle, &ledger, &listener, &pending);
        handle.unbind(pending.raw());
        assert_eq!(handle.bound_sockets(), 0);

        // Nothing is routed to the old sink any more: the context is freed
        // on the spot instead.
        assert_eq!(handle.cancel(pending.raw()), CancelOutcome::Cancelled(1));
        assert!(rx.try_recv().is_err());
        assert!(ledger.stats().is_balanced());
    }

    #[test]
    fn test_shutdown_fails_parked_operations_and_rejects_new_ones() {
        let mut reactor = Reactor::start().unwrap();
        let handle = reactor.handle();
        let ledger = Ledger::new(None);
        let (tx, rx) = channel();
        let (listener, pending) = listener_and_pending(&handle, &tx);

        submit_accept(&handle, &ledger, &listener, &pending);

        reactor.shutdown();
        reactor.shutdown();

        let completion = next(&rx);
        assert_eq!(error_code(&completion), Some(libc::ECANCELED));
        drop(completion);

        let late = ledger.allocate(OpKind::Receive, pending.raw()).unwrap();
        match handle.submit(late) {
            Issued::Completed(c) => assert_eq!(error_code(&c), Some(libc::ECANCELED)),
            Issued::Pending(_) => panic!("a stopped reactor accepted work"),
        }
        assert!(matches!(handle.bind(pending.raw(), tx), Err(Error::PortClosed)));
        assert!(ledger.stats().is_balanced());
    }
}
