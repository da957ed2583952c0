//! Observability sink.
//!
//! Every state transition, failure and received payload is reported as an
//! [`Event`] to an [`Observer`]. The default observer forwards events to the
//! `log` facade; [`Recorder`] additionally keeps them in memory so that tests
//! and embedders can assert on what happened.

use crate::net::TcpState;
use crate::reactor::poller::platform::sys_strerror;
use crate::reactor::{CancelOutcome, OpId, OpKind};

use log::Level;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Which side of the rig an event comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// `log` target used for this role.
    pub fn target(self) -> &'static str {
        match self {
            Role::Server => "lingerprobe::server",
            Role::Client => "lingerprobe::client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("Server"),
            Role::Client => f.write_str("Client"),
        }
    }
}

/// Something a state machine did or saw.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Running,
    Listening {
        addr: SocketAddr,
    },
    /// A fresh socket was created for the next inbound connection.
    AcceptSocket {
        socket: RawFd,
    },
    /// An operation is parked in the reactor.
    Pending {
        kind: OpKind,
        socket: RawFd,
    },
    Accepted {
        socket: RawFd,
        peer: Option<SocketAddr>,
        inline: bool,
    },
    Received {
        socket: RawFd,
        bytes: Vec<u8>,
    },
    /// An empty receive: the peer closed its side.
    RemoteClosed {
        socket: RawFd,
    },
    ConnectIssued {
        socket: RawFd,
        target: SocketAddr,
    },
    Connected {
        socket: RawFd,
        local: Option<SocketAddr>,
        inline: bool,
    },
    Sent {
        socket: RawFd,
        message: String,
        bytes: usize,
        inline: bool,
    },
    /// Per-tick socket diagnostics of a live client connection.
    Diagnostics {
        socket: RawFd,
        state: Option<TcpState>,
        connected_for: Duration,
    },
    OpFailed {
        kind: OpKind,
        socket: RawFd,
        code: Option<i32>,
        description: String,
    },
    /// A completion that no longer matches the slot that issued it.
    Stale {
        kind: OpKind,
        id: OpId,
    },
    ClosingSockets,
    Cancelled {
        socket: RawFd,
        outcome: CancelOutcome,
    },
    SocketClosed {
        socket: RawFd,
        abortive: bool,
    },
    DisconnectIssued {
        socket: RawFd,
    },
    Disconnected {
        socket: RawFd,
    },
    Exited {
        error: Option<String>,
    },
}

impl Event {
    /// Builds an [`Event::OpFailed`] from an OS error.
    pub fn failure(kind: OpKind, socket: RawFd, err: &io::Error) -> Self {
        let code = err.raw_os_error();

        Event::OpFailed {
            kind,
            socket,
            code,
            description: code.map(describe_error).unwrap_or_else(|| err.to_string()),
        }
    }

    /// Log level the event is reported at.
    pub fn level(&self) -> Level {
        match self {
            Event::OpFailed { .. } => Level::Warn,
            Event::Exited { error: Some(_) } => Level::Error,
            Event::Diagnostics { .. } | Event::Stale { .. } => Level::Debug,
            Event::Cancelled {
                outcome: CancelOutcome::NotFound,
                ..
            } => Level::Debug,
            _ => Level::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Running => f.write_str("running..."),
            Event::Listening { addr } => write!(f, "listening on {addr}"),
            Event::AcceptSocket { socket } => write!(f, "new accept socket {socket}"),
            Event::Pending { kind, socket } => write!(f, "{kind} pending for {socket}"),
            Event::Accepted {
                socket,
                peer,
                inline,
            } => {
                write!(f, "accepted {socket}")?;
                if let Some(peer) = peer {
                    write!(f, " from {peer}")?;
                }
                if *inline {
                    f.write_str(" immediately")?;
                }
                Ok(())
            }
            Event::Received { bytes, .. } => write!(
                f,
                "read {} bytes: '{}'",
                bytes.len(),
                String::from_utf8_lossy(bytes)
            ),
            Event::RemoteClosed { socket } => write!(f, "peer closed {socket}"),
            Event::ConnectIssued { socket, target } => {
                write!(f, "connecting {socket} to {target}")
            }
            Event::Connected {
                socket,
                local,
                inline,
            } => {
                write!(f, "connected {socket}")?;
                if let Some(local) = local {
                    write!(f, " as {local}")?;
                }
                if *inline {
                    f.write_str(" immediately")?;
                }
                Ok(())
            }
            Event::Sent {
                message,
                bytes,
                inline,
                ..
            } => {
                let when = if *inline { "immediately" } else { "on completion" };
                write!(f, "sent {bytes} bytes '{message}' {when}")
            }
            Event::Diagnostics {
                socket,
                state,
                connected_for,
            } => {
                write!(f, "socket {socket}: ")?;
                match state {
                    Some(state) => write!(f, "{state}")?,
                    None => f.write_str("state unknown")?,
                }
                write!(f, " connected for {}s", connected_for.as_secs())
            }
            Event::OpFailed {
                kind,
                socket,
                code,
                description,
            } => match code {
                Some(code) => write!(f, "{kind} failed for {socket} with error {code}: {description}"),
                None => write!(f, "{kind} failed for {socket}: {description}"),
            },
            Event::Stale { kind, id } => write!(f, "ignoring stale {kind} completion {id}"),
            Event::ClosingSockets => f.write_str("closing sockets"),
            Event::Cancelled { socket, outcome } => match outcome {
                CancelOutcome::Cancelled(n) => write!(f, "cancelled {n} operation(s) on {socket}"),
                CancelOutcome::NotFound => write!(f, "nothing to cancel on {socket}"),
            },
            Event::SocketClosed { socket, abortive } => {
                if *abortive {
                    write!(f, "reset {socket}")
                } else {
                    write!(f, "closed {socket}")
                }
            }
            Event::DisconnectIssued { socket } => write!(f, "disconnecting {socket}"),
            Event::Disconnected { socket } => write!(f, "disconnect succeeded for {socket}"),
            Event::Exited { error: None } => f.write_str("exiting successfully"),
            Event::Exited { error: Some(error) } => write!(f, "ERROR: {error}; exiting"),
        }
    }
}

/// Receiver of state machine events.
///
/// Called from the thread of the role that produced the event.
pub trait Observer: Send + Sync {
    fn observe(&self, role: Role, event: &Event);
}

/// Forwards events to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn observe(&self, role: Role, event: &Event) {
        log::log!(target: role.target(), event.level(), "{role}: {event}");
    }
}

/// Records events in memory and forwards them to the log.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<(Role, Event)>>,
    changed: Condvar,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<(Role, Event)> {
        self.events.lock().unwrap().clone()
    }

    /// Events recorded for `role`, in order.
    pub fn events_of(&self, role: Role) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Concatenation of every payload the server received.
    pub fn received(&self) -> Vec<u8> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(role, event)| match (role, event) {
                (Role::Server, Event::Received { bytes, .. }) => Some(bytes.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Blocks until `done` holds for the recorded events or `timeout` expires.
    ///
    /// Returns whether the condition was met.
    pub fn wait_until<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&[(Role, Event)]) -> bool,
    {
        let events = self.events.lock().unwrap();
        let (events, _) = self
            .changed
            .wait_timeout_while(events, timeout, |events| !done(events))
            .unwrap();

        done(&events)
    }
}

impl Observer for Recorder {
    fn observe(&self, role: Role, event: &Event) {
        LogObserver.observe(role, event);

        self.events.lock().unwrap().push((role, event.clone()));
        self.changed.notify_all();
    }
}

/// Resolves an OS error code to its human-readable description.
pub fn describe_error(code: i32) -> String {
    sys_strerror(code)
}
