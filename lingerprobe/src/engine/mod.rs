//! The engine driver.
//!
//! An [`Engine`] runs the server and the client on their own threads, each
//! in a cooperative loop over its state machine, on top of one shared
//! reactor. The two roles only share the liveness flag, the "client may
//! connect" gate and the server's published address.

mod builder;
mod driver;
mod shared;

pub use builder::{Config, EngineBuilder, SendFailurePolicy};
pub use shared::{Liveness, Shared};

use crate::error::{Error, Result};
use crate::machine::{Client, Port, Server};
use crate::observe::Role;
use crate::reactor::{Ledger, LedgerStats, Reactor};

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A configured, not yet started, engine.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    liveness: Liveness,
}

/// Terminal status of both roles.
#[derive(Debug)]
pub struct Report {
    pub server: Result<()>,
    pub client: Result<()>,
    /// Ledger counters after the reactor shut down.
    pub contexts: LedgerStats,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.server.is_ok() && self.client.is_ok()
    }
}

/// A running engine.
///
/// Dropping the handle stops the engine and waits for both roles.
pub struct EngineHandle {
    reactor: Reactor,
    ledger: Arc<Ledger>,
    shared: Arc<Shared>,
    server: Option<JoinHandle<Result<()>>>,
    client: Option<JoinHandle<Result<()>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn new(config: Config) -> Self {
        Self {
            config,
            liveness: Liveness::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The flag that stops the engine, for wiring into a signal handler
    /// before starting.
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Starts the reactor and both role threads.
    ///
    /// The server creates its listener on its own thread; if that fails the
    /// liveness flag is cleared, the observer sees the server exit with the
    /// error and the failure shows up in [`Report::server`].
    pub fn start(self) -> Result<EngineHandle> {
        let Engine { config, liveness } = self;

        let reactor = Reactor::start()?;
        let ledger = Ledger::new(config.context_limit);
        let shared = Shared::new(liveness, config.client_may_connect);

        let server = {
            let port = Port::new(
                Role::Server,
                reactor.handle(),
                ledger.clone(),
                config.observer.clone(),
            );
            let mut machine = Server::new(port, shared.clone(), &config);
            let shared = shared.clone();
            let tick = config.server_tick;

            spawn("lingerprobe-server", move || {
                let outcome = driver::drive(&mut machine, shared.liveness(), tick);

                if outcome.is_err() {
                    shared.liveness().stop();
                }
                outcome
            })?
        };

        let client = {
            let port = Port::new(
                Role::Client,
                reactor.handle(),
                ledger.clone(),
                config.observer.clone(),
            );
            let mut machine = Client::new(port, shared.clone(), &config);
            let shared = shared.clone();
            let tick = config.client_tick;

            spawn("lingerprobe-client", move || {
                driver::drive(&mut machine, shared.liveness(), tick)
            })
        };

        let client = match client {
            Ok(client) => client,
            Err(err) => {
                shared.liveness().stop();
                let _ = server.join();
                return Err(err);
            }
        };

        Ok(EngineHandle {
            reactor,
            ledger,
            shared,
            server: Some(server),
            client: Some(client),
        })
    }
}

fn spawn<F>(name: &str, role: F) -> Result<JoinHandle<Result<()>>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(role)
        .map_err(Error::setup("role thread"))
}

fn join(handle: Option<JoinHandle<Result<()>>>, role: Role) -> Result<()> {
    match handle {
        Some(handle) => handle.join().unwrap_or(Err(Error::Panicked { role })),
        None => Ok(()),
    }
}

impl EngineHandle {
    pub fn liveness(&self) -> Liveness {
        self.shared.liveness().clone()
    }

    /// Address the server's listener is bound to, once it exists.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.shared.server_addr()
    }

    /// Polls for the server address for at most `timeout`.
    pub fn wait_for_server(&self, timeout: Duration) -> Option<SocketAddr> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(addr) = self.server_addr() {
                return Some(addr);
            }
            if Instant::now() >= deadline || !self.shared.liveness().is_alive() {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn contexts(&self) -> LedgerStats {
        self.ledger.stats()
    }

    /// Clears the liveness flag. Both roles exit on their next tick.
    pub fn stop(&self) {
        self.shared.liveness().stop();
    }

    /// `true` once both role threads have returned.
    pub fn is_finished(&self) -> bool {
        [&self.server, &self.client]
            .into_iter()
            .all(|handle| handle.as_ref().is_none_or(|h| h.is_finished()))
    }

    /// Waits for both roles, shuts the reactor down and reports.
    ///
    /// Does not stop the engine by itself; call [`stop`](Self::stop) first or
    /// let the liveness flag be cleared elsewhere.
    pub fn join(mut self) -> Report {
        let server = join(self.server.take(), Role::Server);
        let client = join(self.client.take(), Role::Client);

        self.reactor.shutdown();

        Report {
            server,
            client,
            contexts: self.ledger.stats(),
        }
    }
}

impl Drop for EngineHandle {
    /// Stops the engine and waits for both roles.
    fn drop(&mut self) {
        self.stop();

        let _ = join(self.server.take(), Role::Server);
        let _ = join(self.client.take(), Role::Client);

        self.reactor.shutdown();
    }
}
