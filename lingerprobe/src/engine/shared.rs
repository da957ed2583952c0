use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Process-wide "keep running" flag.
///
/// Starts alive; once stopped it never becomes alive again. Clones share
/// the same flag, so a signal handler can hold one while both roles poll
/// another.
#[derive(Clone, Debug)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the flag for good.
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// State the two roles coordinate through.
///
/// Nothing else is shared between the server and the client.
#[derive(Debug)]
pub struct Shared {
    liveness: Liveness,

    /// Gate for the client's connection attempts.
    client_may_connect: AtomicBool,

    /// Address the listener is bound to, once known.
    server_addr: Mutex<Option<SocketAddr>>,
}

impl Shared {
    pub fn new(liveness: Liveness, client_may_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            liveness,
            client_may_connect: AtomicBool::new(client_may_connect),
            server_addr: Mutex::new(None),
        })
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn client_may_connect(&self) -> bool {
        self.client_may_connect.load(Ordering::Acquire)
    }

    /// Lets the client attempt connections.
    pub fn allow_client(&self) {
        self.client_may_connect.store(true, Ordering::Release);
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        *self.server_addr.lock().unwrap()
    }

    pub(crate) fn publish_server_addr(&self, addr: SocketAddr) {
        *self.server_addr.lock().unwrap() = Some(addr);
    }
}
