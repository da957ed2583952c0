use super::{Port, StateMachine};
use crate::engine::{Config, SendFailurePolicy, Shared};
use crate::error::{Error, Result};
use crate::net::Socket;
use crate::observe::Event;
use crate::reactor::{Completion, OpId, OpKind};

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

/// Where the client is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// The outbound connection slot.
enum Link {
    Disconnected,
    Connecting {
        socket: Socket,
        op: OpId,
    },
    Connected {
        socket: Socket,
        since: Instant,
        /// The send in flight, if any.
        send: Option<OpId>,
    },
}

/// The client state machine.
///
/// Connects to the server once the shared gate allows it, then sends
/// `MSG <n>` one message at a time.
pub struct Client {
    port: Port,
    shared: Arc<Shared>,
    send_failure: SendFailurePolicy,
    message_limit: Option<u64>,
    link: Link,
    /// Number of the next message. Survives reconnects.
    next_message: u64,
}

/// Address to connect to for a listener bound to `addr`.
fn connect_target(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

impl Client {
    pub fn new(port: Port, shared: Arc<Shared>, config: &Config) -> Self {
        Self {
            port,
            shared,
            send_failure: config.send_failure,
            message_limit: config.message_limit,
            link: Link::Disconnected,
            next_message: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        match self.link {
            Link::Disconnected => ClientState::Disconnected,
            Link::Connecting { .. } => ClientState::Connecting,
            Link::Connected { .. } => ClientState::Connected,
        }
    }

    /// Local address of the live connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.link {
            Link::Connected { socket, .. } => socket.local_addr().ok(),
            _ => None,
        }
    }

    /// `true` while a send is in flight.
    pub fn is_sending(&self) -> bool {
        matches!(self.link, Link::Connected { send: Some(_), .. })
    }

    /// Number of messages issued so far.
    pub fn messages_issued(&self) -> u64 {
        self.next_message
    }

    fn limit_reached(&self) -> bool {
        self.message_limit
            .is_some_and(|limit| self.next_message >= limit)
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state().to_string(),
        }
    }

    /// Connects a fresh socket to the server's published address.
    ///
    /// Valid only while disconnected, once the server address is known and
    /// the shared gate allows connecting.
    pub fn start_connect(&mut self) -> Result<()> {
        if !matches!(self.link, Link::Disconnected) {
            return Err(self.invalid("start_connect"));
        }
        if !self.shared.client_may_connect() {
            return Err(Error::InvalidState {
                operation: "start_connect",
                state: "waiting for permission to connect".into(),
            });
        }
        let Some(server) = self.shared.server_addr() else {
            return Err(Error::InvalidState {
                operation: "start_connect",
                state: "waiting for the server address".into(),
            });
        };
        let target = connect_target(server);

        let socket = Socket::tcp_v4().map_err(Error::setup("client socket"))?;
        socket
            .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(Error::setup("client bind"))?;
        let ctx = self
            .port
            .allocate(OpKind::Connect, &socket)?
            .with_peer(target);
        self.port.bind(&socket)?;
        self.port.observe(Event::ConnectIssued {
            socket: socket.raw(),
            target,
        });
        let op = self.port.submit(ctx);

        self.link = Link::Connecting { socket, op };
        Ok(())
    }

    /// Sends the next numbered message.
    ///
    /// Valid only while connected with no send in flight and the message
    /// limit not reached.
    pub fn start_send(&mut self) -> Result<()> {
        if self.is_sending() || self.limit_reached() {
            return Err(self.invalid("start_send"));
        }
        let Link::Connected { socket, send, .. } = &mut self.link else {
            return Err(self.invalid("start_send"));
        };

        let message = format!("MSG {}", self.next_message);
        let ctx = self
            .port
            .allocate(OpKind::Send, socket)?
            .with_payload(message.as_bytes());
        self.next_message += 1;

        *send = Some(self.port.submit(ctx));
        Ok(())
    }

    /// Reports the kernel's view of the connection and its age.
    ///
    /// Only reads `TCP_INFO`: a pending error is left for the next send.
    fn diagnostics(&self) {
        let Link::Connected { socket, since, .. } = &self.link else {
            return;
        };

        self.port.observe(Event::Diagnostics {
            socket: socket.raw(),
            state: socket.tcp_state().ok(),
            connected_for: since.elapsed(),
        });
    }

    /// Cancels whatever is in flight and closes the socket.
    fn drop_link(&mut self) {
        let socket = match std::mem::replace(&mut self.link, Link::Disconnected) {
            Link::Disconnected => return,
            Link::Connecting { socket, .. } | Link::Connected { socket, .. } => socket,
        };

        let raw = socket.raw();
        self.port.cancel(&socket);
        self.port.unbind(raw);
        drop(socket);

        self.port.observe(Event::SocketClosed {
            socket: raw,
            abortive: false,
        });
    }

    fn complete_connect(&mut self, completion: Completion) -> Result<()> {
        let id = completion.id();
        let socket = match std::mem::replace(&mut self.link, Link::Disconnected) {
            Link::Connecting { socket, op } if op == id => socket,
            other => {
                self.link = other;
                return self.stale(completion);
            }
        };

        let (ctx, result, inline) = completion.into_parts();
        drop(ctx);

        match result {
            Ok(_) => {
                self.port.observe(Event::Connected {
                    socket: socket.raw(),
                    local: socket.local_addr().ok(),
                    inline,
                });
                self.link = Link::Connected {
                    socket,
                    since: Instant::now(),
                    send: None,
                };
            }
            Err(err) => {
                // Left disconnected: the next tick retries.
                self.port
                    .observe(Event::failure(OpKind::Connect, socket.raw(), &err));
                self.port.unbind(socket.raw());
            }
        }

        Ok(())
    }

    fn complete_send(&mut self, completion: Completion) -> Result<()> {
        let id = completion.id();
        let Link::Connected { send, .. } = &mut self.link else {
            return self.stale(completion);
        };
        if *send != Some(id) {
            return self.stale(completion);
        }
        *send = None;

        let socket = completion.socket();
        let (ctx, result, inline) = completion.into_parts();

        match result {
            Ok(bytes) => {
                self.port.observe(Event::Sent {
                    socket,
                    message: String::from_utf8_lossy(ctx.bytes()).into_owned(),
                    bytes,
                    inline,
                });
                Ok(())
            }
            Err(err) => {
                drop(ctx);
                self.port.observe(Event::failure(OpKind::Send, socket, &err));
                self.send_failed(socket, err)
            }
        }
    }

    fn send_failed(&mut self, socket: RawFd, err: io::Error) -> Result<()> {
        self.drop_link();

        match self.send_failure {
            SendFailurePolicy::Retry => Ok(()),
            SendFailurePolicy::Fatal => Err(Error::SendFailed {
                socket,
                source: err,
            }),
        }
    }

    fn stale(&self, completion: Completion) -> Result<()> {
        self.port.observe(Event::Stale {
            kind: completion.kind(),
            id: completion.id(),
        });
        Ok(())
    }
}

impl StateMachine for Client {
    fn port(&mut self) -> &mut Port {
        &mut self.port
    }

    fn dispatch(&mut self, completion: Completion) -> Result<()> {
        match completion.kind() {
            OpKind::Connect => self.complete_connect(completion),
            OpKind::Send => self.complete_send(completion),
            OpKind::Accept | OpKind::Receive | OpKind::Disconnect => self.stale(completion),
        }
    }

    /// Connects when allowed, or sends the next message when connected.
    fn step(&mut self) -> Result<()> {
        match &self.link {
            Link::Disconnected => {
                if self.shared.client_may_connect() && self.shared.server_addr().is_some() {
                    self.start_connect()
                } else {
                    Ok(())
                }
            }
            Link::Connecting { .. } => Ok(()),
            Link::Connected { send, .. } => {
                let idle = send.is_none();
                self.diagnostics();

                if idle && !self.limit_reached() {
                    self.start_send()
                } else {
                    Ok(())
                }
            }
        }
    }

    fn teardown(&mut self) -> Result<()> {
        self.drop_link();
        Ok(())
    }

    fn describe(&self) -> String {
        self.state().to_string()
    }
}
