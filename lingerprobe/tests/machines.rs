use lingerprobe::engine::{Liveness, Shared};
use lingerprobe::machine::{Client, ClientState, Port, Server, ServerState, StateMachine};
use lingerprobe::reactor::{Ledger, OpKind, Reactor};
use lingerprobe::{Config, Error, Event, Recorder, Role, SendFailurePolicy};

use std::net::{Ipv4Addr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(10);

struct Rig {
    reactor: Reactor,
    ledger: Arc<Ledger>,
    shared: Arc<Shared>,
    recorder: Arc<Recorder>,
    config: Config,
}

impl Rig {
    fn new(config: Config) -> Self {
        let recorder = Recorder::new();
        let config = Config {
            observer: recorder.clone(),
            ..config
        };

        Self {
            reactor: Reactor::start().unwrap(),
            ledger: Ledger::new(config.context_limit),
            shared: Shared::new(Liveness::new(), config.client_may_connect),
            recorder,
            config,
        }
    }

    fn port(&self, role: Role) -> Port {
        Port::new(
            role,
            self.reactor.handle(),
            self.ledger.clone(),
            self.config.observer.clone(),
        )
    }

    fn server(&self) -> Server {
        Server::new(self.port(Role::Server), self.shared.clone(), &self.config)
    }

    fn client(&self) -> Client {
        Client::new(self.port(Role::Client), self.shared.clone(), &self.config)
    }

    fn count(&self, role: Role, matches: impl Fn(&Event) -> bool) -> usize {
        self.recorder
            .events_of(role)
            .iter()
            .filter(|event| matches(event))
            .count()
    }
}

/// Pumps `machine` until `done` holds or the timeout expires.
fn pump_until<M: StateMachine>(machine: &mut M, done: impl Fn(&M) -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;

    while Instant::now() < deadline {
        machine.pump(TICK).unwrap();
        if done(machine) {
            return true;
        }
    }

    false
}

/// Brings up a server with an accepted connection and a connected client.
fn connected(rig: &Rig) -> (Server, Client) {
    let mut server = rig.server();
    let mut client = rig.client();

    server.create_listener().unwrap();
    server.start_accept().unwrap();

    client.step().unwrap();
    assert_ne!(client.state(), ClientState::Disconnected);

    assert!(pump_until(&mut server, |s| s.state() == ServerState::Accepted));
    assert!(pump_until(&mut client, |c| c.state() == ClientState::Connected));

    (server, client)
}

#[test]
fn test_accept_is_mutually_exclusive() {
    let rig = Rig::new(Config::default());
    let mut server = rig.server();

    assert!(matches!(server.start_accept(), Err(Error::InvalidState { .. })));

    server.create_listener().unwrap();
    assert!(rig.shared.server_addr().is_some());
    server.start_accept().unwrap();
    assert_eq!(server.state(), ServerState::AcceptPending);

    match server.start_accept() {
        Err(Error::InvalidState { operation, state }) => {
            assert_eq!(operation, "start_accept");
            assert_eq!(state, "accept pending");
        }
        other => panic!("second accept was allowed: {other:?}"),
    }

    let mut client = rig.client();
    client.step().unwrap();
    assert!(pump_until(&mut server, |s| s.state() == ServerState::Accepted));

    assert!(matches!(server.start_accept(), Err(Error::InvalidState { .. })));

    // Stepping an accepted server never starts another accept.
    for _ in 0..5 {
        server.step().unwrap();
        server.pump(TICK).unwrap();
    }
    assert_eq!(server.state(), ServerState::Accepted);
    assert_eq!(rig.count(Role::Server, |e| matches!(e, Event::Accepted { .. })), 1);
    assert_eq!(
        rig.count(Role::Server, |e| matches!(e, Event::AcceptSocket { .. })),
        1
    );
}

#[test]
fn test_receive_loop_stops_after_remote_close() {
    let rig = Rig::new(Config::default());
    let (mut server, mut client) = connected(&rig);
    assert!(server.is_receiving());

    client.step().unwrap();
    client.settle().unwrap();
    assert!(pump_until(&mut server, |_| rig.recorder.received() == b"MSG 0"));
    assert!(server.is_receiving());

    client.teardown().unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);

    assert!(pump_until(&mut server, |s| s.remote_closed()));
    assert!(!server.is_receiving());

    for _ in 0..5 {
        server.step().unwrap();
        server.pump(TICK).unwrap();
    }
    assert!(!server.is_receiving());
    assert_eq!(server.state(), ServerState::Accepted);
    assert_eq!(
        rig.count(Role::Server, |e| matches!(e, Event::RemoteClosed { .. })),
        1
    );
}

#[test]
fn test_teardown_without_sockets_is_a_noop() {
    let rig = Rig::new(Config::default());
    let mut server = rig.server();
    let mut client = rig.client();

    server.teardown().unwrap();
    server.teardown().unwrap();
    client.teardown().unwrap();

    assert_eq!(server.state(), ServerState::Closed);
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(rig.recorder.events().is_empty());

    // A closed server stays closed.
    server.step().unwrap();
    assert_eq!(server.state(), ServerState::Closed);
}

#[test]
fn test_graceful_teardown_disconnects_accepted_socket() {
    let rig = Rig::new(Config::default());
    let (mut server, mut client) = connected(&rig);

    server.teardown().unwrap();
    assert_eq!(server.state(), ServerState::Closing);
    assert_eq!(
        rig.count(Role::Server, |e| matches!(e, Event::DisconnectIssued { .. })),
        1
    );

    // The disconnect completes once the client closes its side.
    client.teardown().unwrap();
    assert!(pump_until(&mut server, |s| s.state() == ServerState::Closed));
    assert_eq!(
        rig.count(Role::Server, |e| matches!(e, Event::Disconnected { .. })),
        1
    );

    server.teardown().unwrap();
    assert_eq!(
        rig.count(Role::Server, |e| matches!(e, Event::ClosingSockets)),
        1
    );

    // Every closed socket took its completion route with it.
    assert_eq!(rig.reactor.handle().bound_sockets(), 0);

    drop(server);
    drop(client);
    assert!(rig.ledger.stats().is_balanced());
}

#[test]
fn test_abrupt_close_surfaces_send_error() {
    let rig = Rig::new(Config {
        abrupt_close: true,
        ..Config::default()
    });
    let (mut server, mut client) = connected(&rig);

    server.step().unwrap();
    assert_eq!(server.state(), ServerState::Closed);
    assert!(rig.count(Role::Server, |e| matches!(e, Event::SocketClosed { abortive: true, .. })) >= 2);
    // Nothing was sent before the reset.
    assert_eq!(rig.count(Role::Server, |e| matches!(e, Event::Received { .. })), 0);

    let send_failed = |rig: &Rig| {
        rig.count(Role::Client, |e| {
            matches!(e, Event::OpFailed { kind: OpKind::Send, .. })
        }) > 0
    };

    let deadline = Instant::now() + TIMEOUT;
    while !send_failed(&rig) && Instant::now() < deadline {
        client.pump(TICK).unwrap();
        if client.state() == ClientState::Connected {
            client.step().unwrap();
            client.settle().unwrap();
        }
    }

    assert!(send_failed(&rig));
    assert_eq!(client.state(), ClientState::Disconnected);

    // The per-tick diagnostics ran before the send and left the reset for it.
    assert!(rig.count(Role::Client, |e| matches!(e, Event::Diagnostics { .. })) > 0);
    let codes: Vec<_> = rig
        .recorder
        .events_of(Role::Client)
        .into_iter()
        .filter_map(|e| match e {
            Event::OpFailed {
                kind: OpKind::Send,
                code,
                ..
            } => Some(code),
            _ => None,
        })
        .collect();
    assert_eq!(codes, [Some(libc::ECONNRESET)]);
}

#[test]
fn test_reset_connection_is_released_and_accept_reissued() {
    let rig = Rig::new(Config::default());
    let mut server = rig.server();

    let addr = server.create_listener().unwrap();
    server.start_accept().unwrap();

    let peer = TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port())).unwrap();
    assert!(pump_until(&mut server, |s| s.state() == ServerState::Accepted));
    assert!(server.is_receiving());

    // Zero linger turns the close into a reset.
    let abortive = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let rc = unsafe {
        libc::setsockopt(
            peer.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &abortive as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
    drop(peer);

    assert!(pump_until(&mut server, |s| s.state() == ServerState::Listening));
    assert!(server.accepted_socket().is_none());
    assert_eq!(rig.reactor.handle().bound_sockets(), 0);

    let failures: Vec<_> = rig
        .recorder
        .events_of(Role::Server)
        .into_iter()
        .filter_map(|e| match e {
            Event::OpFailed { kind, code, .. } => Some((kind, code)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, [(OpKind::Receive, Some(libc::ECONNRESET))]);

    server.step().unwrap();
    assert_eq!(server.state(), ServerState::AcceptPending);
    assert_eq!(
        rig.count(Role::Server, |e| matches!(e, Event::AcceptSocket { .. })),
        2
    );
}

#[test]
fn test_fatal_send_policy_stops_the_client() {
    let rig = Rig::new(Config {
        abrupt_close: true,
        send_failure: SendFailurePolicy::Fatal,
        ..Config::default()
    });
    let (mut server, mut client) = connected(&rig);
    server.step().unwrap();

    let deadline = Instant::now() + TIMEOUT;
    let outcome = loop {
        assert!(Instant::now() < deadline, "send never failed");

        let outcome = client.pump(TICK).and_then(|_| {
            if client.state() == ClientState::Connected {
                client.step()?;
                client.settle()?;
            }
            Ok(())
        });

        if outcome.is_err() {
            break outcome;
        }
    };

    assert!(matches!(outcome, Err(Error::SendFailed { .. })));
}

#[test]
fn test_client_waits_for_permission() {
    let rig = Rig::new(Config {
        client_may_connect: false,
        ..Config::default()
    });
    let mut server = rig.server();
    let mut client = rig.client();
    server.create_listener().unwrap();

    client.step().unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(matches!(client.start_connect(), Err(Error::InvalidState { .. })));

    rig.shared.allow_client();
    client.step().unwrap();
    assert_ne!(client.state(), ClientState::Disconnected);
}

#[test]
fn test_messages_are_numbered_without_gaps() {
    let rig = Rig::new(Config {
        message_limit: Some(4),
        ..Config::default()
    });
    let (mut server, mut client) = connected(&rig);

    for _ in 0..4 {
        assert!(pump_until(&mut client, |c| !c.is_sending()));
        client.step().unwrap();
        client.settle().unwrap();
    }
    assert!(pump_until(&mut client, |c| !c.is_sending()));
    assert_eq!(client.messages_issued(), 4);

    // The limit is reached: further ticks only report diagnostics.
    client.step().unwrap();
    assert!(matches!(client.start_send(), Err(Error::InvalidState { .. })));

    let sent: Vec<String> = rig
        .recorder
        .events_of(Role::Client)
        .into_iter()
        .filter_map(|e| match e {
            Event::Sent { message, .. } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(sent, ["MSG 0", "MSG 1", "MSG 2", "MSG 3"]);

    assert!(pump_until(&mut server, |_| rig.recorder.received().len() == 20));
    assert_eq!(rig.recorder.received(), b"MSG 0MSG 1MSG 2MSG 3");
}

#[test]
fn test_exhausted_contexts_fail_the_issuing_call() {
    let rig = Rig::new(Config {
        context_limit: Some(0),
        ..Config::default()
    });
    let mut server = rig.server();
    server.create_listener().unwrap();

    match server.start_accept() {
        Err(Error::OutOfContexts { limit }) => assert_eq!(limit, 0),
        other => panic!("accept without a context: {other:?}"),
    }
    assert_eq!(server.state(), ServerState::Listening);
    assert_eq!(rig.ledger.stats().allocated, 0);
    assert_eq!(rig.reactor.handle().bound_sockets(), 0);
}

#[test]
fn test_every_context_is_freed_exactly_once() {
    let rig = Rig::new(Config {
        message_limit: Some(2),
        ..Config::default()
    });

    {
        let (mut server, mut client) = connected(&rig);
        for _ in 0..2 {
            assert!(pump_until(&mut client, |c| !c.is_sending()));
            client.step().unwrap();
            client.settle().unwrap();
        }
        assert!(pump_until(&mut server, |_| rig.recorder.received().len() == 10));

        server.teardown().unwrap();
        client.teardown().unwrap();
        server.pump(TICK).unwrap();
    }

    let mut reactor = rig.reactor;
    reactor.shutdown();

    let stats = rig.ledger.stats();
    assert!(stats.allocated > 0);
    assert!(stats.is_balanced(), "{stats:?}");
}
