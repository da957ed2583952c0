use super::{Port, StateMachine};
use crate::engine::{Config, Shared};
use crate::error::{Error, Result};
use crate::net::Socket;
use crate::observe::Event;
use crate::reactor::{Completion, OpId, OpKind};

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::Arc;

/// Where the server is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    NoListener,
    Listening,
    AcceptPending,
    Accepted,
    /// Sockets are released but a disconnect is still in flight.
    Closing,
    Closed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::NoListener => "no listener",
            ServerState::Listening => "listening",
            ServerState::AcceptPending => "accept pending",
            ServerState::Accepted => "accepted",
            ServerState::Closing => "closing",
            ServerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Socket an accept will complete onto.
struct PendingAccept {
    socket: Socket,
    op: OpId,
}

/// The single accepted connection.
struct Connection {
    socket: Socket,
    /// The receive in flight, if any. Never more than one.
    recv: Option<OpId>,
    /// Set by an empty receive; no receive is issued afterwards.
    remote_closed: bool,
}

/// The server state machine.
///
/// Owns one listening socket, at most one pending accept and at most one
/// accepted connection. An accepted connection is read in a loop, one
/// receive at a time, until the peer closes it.
pub struct Server {
    port: Port,
    shared: Arc<Shared>,
    abrupt_close: bool,
    graceful_disconnect: bool,

    listener: Option<Socket>,
    pending: Option<PendingAccept>,
    accepted: Option<Connection>,

    /// Disconnect issued by teardown; its completion is not awaited.
    disconnect: Option<OpId>,
    closed: bool,
}

impl Server {
    pub fn new(port: Port, shared: Arc<Shared>, config: &Config) -> Self {
        Self {
            port,
            shared,
            abrupt_close: config.abrupt_close,
            graceful_disconnect: config.graceful_disconnect,
            listener: None,
            pending: None,
            accepted: None,
            disconnect: None,
            closed: false,
        }
    }

    pub fn state(&self) -> ServerState {
        if self.closed {
            if self.disconnect.is_some() {
                ServerState::Closing
            } else {
                ServerState::Closed
            }
        } else if self.accepted.is_some() {
            ServerState::Accepted
        } else if self.pending.is_some() {
            ServerState::AcceptPending
        } else if self.listener.is_some() {
            ServerState::Listening
        } else {
            ServerState::NoListener
        }
    }

    /// Descriptor of the accepted connection, if any.
    pub fn accepted_socket(&self) -> Option<RawFd> {
        self.accepted.as_ref().map(|conn| conn.socket.raw())
    }

    /// `true` while a receive is in flight on the accepted connection.
    pub fn is_receiving(&self) -> bool {
        self.accepted.as_ref().is_some_and(|conn| conn.recv.is_some())
    }

    /// `true` once the peer closed the accepted connection.
    pub fn remote_closed(&self) -> bool {
        self.accepted.as_ref().is_some_and(|conn| conn.remote_closed)
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state().to_string(),
        }
    }

    /// Binds a listener to an ephemeral port on the wildcard address and
    /// publishes the bound address for the client.
    pub fn create_listener(&mut self) -> Result<SocketAddr> {
        if self.state() != ServerState::NoListener {
            return Err(self.invalid("create_listener"));
        }

        let listener = Socket::tcp_v4().map_err(Error::setup("listener socket"))?;
        listener
            .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(Error::setup("bind"))?;
        listener
            .listen(libc::SOMAXCONN)
            .map_err(Error::setup("listen"))?;
        let addr = listener.local_addr().map_err(Error::setup("getsockname"))?;

        self.shared.publish_server_addr(addr);
        self.port.observe(Event::Listening { addr });
        self.listener = Some(listener);

        Ok(addr)
    }

    /// Issues an accept onto a fresh socket.
    ///
    /// Valid only while listening with no accept pending and no accepted
    /// connection.
    pub fn start_accept(&mut self) -> Result<()> {
        if self.state() != ServerState::Listening {
            return Err(self.invalid("start_accept"));
        }
        let Some(listener) = &self.listener else {
            return Err(self.invalid("start_accept"));
        };

        let socket = Socket::with_protocol_of(listener).map_err(Error::setup("accept socket"))?;
        let ctx = self
            .port
            .allocate(OpKind::Accept, &socket)?
            .with_listener(listener.raw());

        self.port.bind(&socket)?;
        self.port.observe(Event::AcceptSocket {
            socket: socket.raw(),
        });
        let op = self.port.submit(ctx);

        self.pending = Some(PendingAccept { socket, op });
        Ok(())
    }

    fn start_recv(&mut self) -> Result<()> {
        if !self
            .accepted
            .as_ref()
            .is_some_and(|conn| conn.recv.is_none() && !conn.remote_closed)
        {
            return Err(self.invalid("start_recv"));
        }
        let Some(conn) = self.accepted.as_mut() else {
            return Ok(());
        };

        let ctx = self.port.allocate(OpKind::Receive, &conn.socket)?;
        conn.recv = Some(self.port.submit(ctx));

        Ok(())
    }

    fn complete_accept(&mut self, completion: Completion) -> Result<()> {
        let id = completion.id();
        let Some(pending) = self.pending.take_if(|pending| pending.op == id) else {
            return self.stale(completion);
        };

        let (ctx, result, inline) = completion.into_parts();
        drop(ctx);

        // The accepted socket has to report its peer before it is promoted.
        let accepted = result.and_then(|_| pending.socket.peer_addr());

        match accepted {
            Ok(peer) => {
                self.port.observe(Event::Accepted {
                    socket: pending.socket.raw(),
                    peer: Some(peer),
                    inline,
                });

                if !self.abrupt_close {
                    self.shared.allow_client();
                }

                self.accepted = Some(Connection {
                    socket: pending.socket,
                    recv: None,
                    remote_closed: false,
                });
                self.start_recv()
            }
            Err(err) => {
                self.port
                    .observe(Event::failure(OpKind::Accept, pending.socket.raw(), &err));
                self.port.unbind(pending.socket.raw());
                Ok(())
            }
        }
    }

    fn complete_receive(&mut self, completion: Completion) -> Result<()> {
        let id = completion.id();
        let Some(conn) = self
            .accepted
            .as_mut()
            .filter(|conn| conn.recv == Some(id))
        else {
            return self.stale(completion);
        };
        conn.recv = None;
        let socket = conn.socket.raw();

        let (ctx, result, _) = completion.into_parts();

        match result {
            Ok(0) => {
                conn.remote_closed = true;
                self.port.observe(Event::RemoteClosed { socket });
                Ok(())
            }
            Ok(_) => {
                self.port.observe(Event::Received {
                    socket,
                    bytes: ctx.bytes().to_vec(),
                });
                drop(ctx);
                self.start_recv()
            }
            Err(err) => {
                self.port
                    .observe(Event::failure(OpKind::Receive, socket, &err));
                if let Some(conn) = self.accepted.take() {
                    self.release(conn.socket, false);
                }
                Ok(())
            }
        }
    }

    fn complete_disconnect(&mut self, completion: Completion) -> Result<()> {
        if self.disconnect != Some(completion.id()) {
            return self.stale(completion);
        }
        self.disconnect = None;

        let socket = completion.socket();
        let (ctx, result, _) = completion.into_parts();
        self.port.unbind(socket);
        // Frees the context and closes the socket it owns.
        drop(ctx);

        match result {
            Ok(_) => self.port.observe(Event::Disconnected { socket }),
            Err(err) => self
                .port
                .observe(Event::failure(OpKind::Disconnect, socket, &err)),
        }

        Ok(())
    }

    fn stale(&self, completion: Completion) -> Result<()> {
        self.port.observe(Event::Stale {
            kind: completion.kind(),
            id: completion.id(),
        });
        Ok(())
    }

    /// Closes `socket`, resetting the connection if `abortive`.
    fn release(&self, socket: Socket, abortive: bool) {
        let raw = socket.raw();
        self.port.cancel(&socket);
        self.port.unbind(raw);

        if abortive {
            if let Err(err) = socket.set_abortive_linger() {
                log::warn!(target: "lingerprobe::server", "Server: SO_LINGER on {raw} failed: {err}");
            }
        }

        drop(socket);
        self.port.observe(Event::SocketClosed {
            socket: raw,
            abortive,
        });
    }

    /// Releases the listener, the pending socket and the accepted connection.
    ///
    /// Outstanding operations on each are cancelled first. The listener is
    /// always reset; the other two only in abrupt-close mode. Otherwise the
    /// accepted connection gets a disconnect that owns the socket from then
    /// on. Once everything is released, calling this again does nothing.
    pub fn close_sockets(&mut self) -> Result<()> {
        self.closed = true;

        if self.listener.is_none() && self.pending.is_none() && self.accepted.is_none() {
            return Ok(());
        }

        self.port.observe(Event::ClosingSockets);

        if let Some(listener) = self.listener.take() {
            self.release(listener, true);
        }

        if let Some(pending) = self.pending.take() {
            self.release(pending.socket, self.abrupt_close);
        }

        if let Some(conn) = self.accepted.take() {
            if self.abrupt_close || !self.graceful_disconnect {
                self.release(conn.socket, self.abrupt_close);
            } else {
                let socket = conn.socket.raw();
                self.port.cancel(&conn.socket);

                let ctx = self
                    .port
                    .allocate(OpKind::Disconnect, &conn.socket)?
                    .owning(conn.socket);
                self.port.observe(Event::DisconnectIssued { socket });
                self.disconnect = Some(self.port.submit(ctx));
            }
        }

        Ok(())
    }
}

impl StateMachine for Server {
    fn port(&mut self) -> &mut Port {
        &mut self.port
    }

    /// Creates the listener so that its address is published before the
    /// first tick.
    fn prepare(&mut self) -> Result<()> {
        match self.state() {
            ServerState::NoListener => self.create_listener().map(|_| ()),
            _ => Ok(()),
        }
    }

    fn dispatch(&mut self, completion: Completion) -> Result<()> {
        match completion.kind() {
            OpKind::Accept => self.complete_accept(completion),
            OpKind::Receive => self.complete_receive(completion),
            OpKind::Disconnect => self.complete_disconnect(completion),
            OpKind::Connect | OpKind::Send => self.stale(completion),
        }
    }

    /// Creates the listener, starts an accept, or, in abrupt-close mode,
    /// tears everything down as soon as an accept is outstanding.
    fn step(&mut self) -> Result<()> {
        match self.state() {
            ServerState::NoListener => self.create_listener().map(|_| ()),
            ServerState::Listening => self.start_accept(),
            ServerState::AcceptPending | ServerState::Accepted if self.abrupt_close => {
                self.close_sockets()
            }
            _ => Ok(()),
        }
    }

    fn teardown(&mut self) -> Result<()> {
        self.close_sockets()
    }

    fn describe(&self) -> String {
        self.state().to_string()
    }
}
