use super::Engine;
use crate::observe::{LogObserver, Observer};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// What the client does when a send completes with an error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendFailurePolicy {
    /// Drop the connection and reconnect on a later tick.
    #[default]
    Retry,
    /// Stop the client loop.
    Fatal,
}

impl FromStr for SendFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retry" => Ok(SendFailurePolicy::Retry),
            "fatal" => Ok(SendFailurePolicy::Fatal),
            other => Err(format!("unknown send failure policy '{other}' (expected retry or fatal)")),
        }
    }
}

/// Engine configuration.
#[derive(Clone)]
pub struct Config {
    /// Force-close the server's sockets on every tick where an accept is
    /// pending or a connection is accepted.
    pub abrupt_close: bool,

    /// Tear the accepted connection down with a disconnect operation
    /// instead of closing it outright.
    pub graceful_disconnect: bool,

    /// Initial value of the shared "client may connect" flag.
    pub client_may_connect: bool,

    /// Idle wait of the server loop.
    pub server_tick: Duration,

    /// Idle wait of the client loop.
    pub client_tick: Duration,

    pub send_failure: SendFailurePolicy,

    /// Stop issuing sends after this many messages.
    pub message_limit: Option<u64>,

    /// Maximum number of live operation contexts.
    pub context_limit: Option<usize>,

    /// Sink for everything the machines report.
    pub observer: Arc<dyn Observer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            abrupt_close: false,
            graceful_disconnect: true,
            client_may_connect: true,
            server_tick: Duration::from_millis(1),
            client_tick: Duration::from_millis(1000),
            send_failure: SendFailurePolicy::Retry,
            message_limit: None,
            context_limit: None,
            observer: Arc::new(LogObserver),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("abrupt_close", &self.abrupt_close)
            .field("graceful_disconnect", &self.graceful_disconnect)
            .field("client_may_connect", &self.client_may_connect)
            .field("server_tick", &self.server_tick)
            .field("client_tick", &self.client_tick)
            .field("send_failure", &self.send_failure)
            .field("message_limit", &self.message_limit)
            .field("context_limit", &self.context_limit)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring and creating an [`Engine`].
///
/// # Examples
///
/// ```rust,no_run
/// use lingerprobe::EngineBuilder;
/// use std::time::Duration;
///
/// let engine = EngineBuilder::new()
///     .abrupt_close(true)
///     .client_tick(Duration::from_millis(50))
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: Config,
}

impl EngineBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abrupt_close(mut self, enabled: bool) -> Self {
        self.config.abrupt_close = enabled;
        self
    }

    pub fn graceful_disconnect(mut self, enabled: bool) -> Self {
        self.config.graceful_disconnect = enabled;
        self
    }

    pub fn client_may_connect(mut self, allowed: bool) -> Self {
        self.config.client_may_connect = allowed;
        self
    }

    /// Sets the server's idle wait.
    ///
    /// # Panics
    ///
    /// Panics if `tick` is zero.
    pub fn server_tick(mut self, tick: Duration) -> Self {
        assert!(!tick.is_zero(), "server_tick must be > 0");

        self.config.server_tick = tick;
        self
    }

    /// Sets the client's idle wait.
    ///
    /// # Panics
    ///
    /// Panics if `tick` is zero.
    pub fn client_tick(mut self, tick: Duration) -> Self {
        assert!(!tick.is_zero(), "client_tick must be > 0");

        self.config.client_tick = tick;
        self
    }

    pub fn send_failure(mut self, policy: SendFailurePolicy) -> Self {
        self.config.send_failure = policy;
        self
    }

    pub fn message_limit(mut self, limit: u64) -> Self {
        self.config.message_limit = Some(limit);
        self
    }

    pub fn context_limit(mut self, limit: usize) -> Self {
        self.config.context_limit = Some(limit);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.config.observer = observer;
        self
    }

    /// Finishes configuration. Nothing runs until [`Engine::start`].
    pub fn build(self) -> Engine {
        Engine::new(self.config)
    }
}
