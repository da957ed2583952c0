//! Operation contexts and the ledger that tracks them.
//!
//! An [`OpContext`] describes exactly one in-flight socket operation. It is
//! allocated from a [`Ledger`] right before the operation is issued, moved
//! into the reactor while the operation waits, and handed back inside a
//! [`Completion`]. Dropping the context is the only way to free it, so the
//! dispatcher that consumes a completion frees it exactly once.

use crate::error::{Error, Result};
use crate::net::Socket;

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

/// Size of the per-operation scratch buffer.
pub const SCRATCH_LEN: usize = 1024;

/// The kind of socket operation a context describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Connect,
    Accept,
    Send,
    Receive,
    Disconnect,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Connect => "connect",
            OpKind::Accept => "accept",
            OpKind::Send => "send",
            OpKind::Receive => "recv",
            OpKind::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Unique identifier of an operation context.
///
/// Identifiers are never reused within a ledger, so a completion can always
/// be matched against the slot that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single in-flight socket operation.
pub struct OpContext {
    id: OpId,
    kind: OpKind,
    /// Socket the operation belongs to.
    socket: RawFd,
    /// Listening socket an accept waits on.
    listener: Option<RawFd>,
    /// Connect target, or the remote address once an accept completed.
    peer: Option<SocketAddr>,
    buf: [u8; SCRATCH_LEN],
    len: usize,
    /// Bytes already written by a partially completed send.
    progress: usize,
    /// Set once the first syscall of a multi-step operation was issued.
    started: bool,
    /// Socket whose lifetime is tied to this context.
    owned: Option<Socket>,
    ledger: Arc<Ledger>,
}

impl OpContext {
    /// Identifier assigned by the ledger.
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Raw descriptor of the socket the operation belongs to.
    pub fn socket(&self) -> RawFd {
        self.socket
    }

    /// Remote address: the connect target, or the accepted peer.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Payload of a send, or the bytes of a completed receive.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Descriptor the reactor waits on for this operation.
    pub(crate) fn wait_fd(&self) -> RawFd {
        self.listener.unwrap_or(self.socket)
    }

    pub(crate) fn with_listener(mut self: Box<Self>, listener: RawFd) -> Box<Self> {
        self.listener = Some(listener);
        self
    }

    pub(crate) fn with_peer(mut self: Box<Self>, peer: SocketAddr) -> Box<Self> {
        self.peer = Some(peer);
        self
    }

    /// Copies `payload` into the scratch buffer, truncating it to [`SCRATCH_LEN`].
    pub(crate) fn with_payload(mut self: Box<Self>, payload: &[u8]) -> Box<Self> {
        let len = payload.len().min(SCRATCH_LEN);
        self.buf[..len].copy_from_slice(&payload[..len]);
        self.len = len;
        self
    }

    /// Ties `socket` to this context: it is closed when the context is freed.
    pub(crate) fn owning(mut self: Box<Self>, socket: Socket) -> Box<Self> {
        self.socket = socket.raw();
        self.owned = Some(socket);
        self
    }

    pub(crate) fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    pub(crate) fn scratch(&mut self) -> &mut [u8; SCRATCH_LEN] {
        &mut self.buf
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(SCRATCH_LEN);
    }

    /// Bytes of the payload that still have to be written.
    pub(crate) fn unsent(&self) -> &[u8] {
        &self.buf[self.progress..self.len]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.progress = (self.progress + n).min(self.len);
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Marks the context as started, returning `true` the first time.
    pub(crate) fn start(&mut self) -> bool {
        !std::mem::replace(&mut self.started, true)
    }
}

impl fmt::Debug for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("socket", &self.socket)
            .field("listener", &self.listener)
            .field("peer", &self.peer)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for OpContext {
    fn drop(&mut self) {
        self.ledger.release(self.id);
    }
}

/// The result of an operation, carrying its context back to the dispatcher.
#[derive(Debug)]
pub struct Completion {
    ctx: Box<OpContext>,
    result: io::Result<usize>,
    inline: bool,
}

impl Completion {
    pub(crate) fn new(ctx: Box<OpContext>, result: io::Result<usize>, inline: bool) -> Self {
        Self {
            ctx,
            result,
            inline,
        }
    }

    /// Completion for an operation that never reached the OS.
    pub(crate) fn failed(ctx: Box<OpContext>, code: i32, inline: bool) -> Self {
        Self::new(ctx, Err(io::Error::from_raw_os_error(code)), inline)
    }

    pub fn id(&self) -> OpId {
        self.ctx.id
    }

    pub fn kind(&self) -> OpKind {
        self.ctx.kind
    }

    pub fn socket(&self) -> RawFd {
        self.ctx.socket
    }

    /// Byte count on success, OS error otherwise.
    pub fn result(&self) -> &io::Result<usize> {
        &self.result
    }

    /// `true` if the operation finished on the issuing thread.
    pub fn is_inline(&self) -> bool {
        self.inline
    }

    pub fn into_parts(self) -> (Box<OpContext>, io::Result<usize>, bool) {
        (self.ctx, self.result, self.inline)
    }
}

/// Snapshot of the ledger counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub allocated: u64,
    pub freed: u64,
    pub live: usize,
    pub double_frees: u64,
}

impl LedgerStats {
    /// `true` when every allocated context was freed exactly once.
    pub fn is_balanced(&self) -> bool {
        self.live == 0 && self.double_frees == 0 && self.allocated == self.freed
    }
}

#[derive(Default)]
struct LedgerState {
    next: u64,
    live: HashSet<u64>,
    allocated: u64,
    freed: u64,
    double_frees: u64,
}

/// Allocation tracker for operation contexts.
///
/// Every context is recorded live from allocation until it is dropped.
/// An optional capacity bounds the number of live contexts.
pub struct Ledger {
    limit: Option<usize>,
    state: Mutex<LedgerState>,
}

impl Ledger {
    pub fn new(limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            limit,
            state: Mutex::new(LedgerState::default()),
        })
    }

    /// Allocates a zeroed context for an operation of `kind` on `socket`.
    ///
    /// Fails with [`Error::OutOfContexts`] when the capacity is exhausted.
    pub fn allocate(self: &Arc<Self>, kind: OpKind, socket: RawFd) -> Result<Box<OpContext>> {
        let id = {
            let mut state = self.state.lock().unwrap();

            if let Some(limit) = self.limit.filter(|&limit| state.live.len() >= limit) {
                return Err(Error::OutOfContexts { limit });
            }

            let id = state.next;
            state.next += 1;
            state.allocated += 1;
            state.live.insert(id);
            id
        };

        Ok(Box::new(OpContext {
            id: OpId(id),
            kind,
            socket,
            listener: None,
            peer: None,
            buf: [0; SCRATCH_LEN],
            len: 0,
            progress: 0,
            started: false,
            owned: None,
            ledger: self.clone(),
        }))
    }

    /// Records that `id` was freed.
    fn release(&self, id: OpId) {
        let mut state = self.state.lock().unwrap();

        if state.live.remove(&id.0) {
            state.freed += 1;
        } else {
            state.double_frees += 1;
            log::error!(target: "lingerprobe::ledger", "context {id} freed twice");
        }
    }

    /// `true` if the context `id` is still allocated.
    pub fn is_live(&self, id: OpId) -> bool {
        self.state.lock().unwrap().live.contains(&id.0)
    }

    pub fn stats(&self) -> LedgerStats {
        let state = self.state.lock().unwrap();

        LedgerStats {
            allocated: state.allocated,
            freed: state.freed,
            live: state.live.len(),
            double_frees: state.double_frees,
        }
    }
}
