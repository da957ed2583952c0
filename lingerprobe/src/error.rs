use crate::observe::Role;

use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

/// Errors that end a role's loop.
///
/// Per-operation failures reported through completions are not errors at
/// this level: they are observed and the affected slot is reset.
#[derive(Error, Debug)]
pub enum Error {
    #[error("setup failed at {stage}: {source}")]
    Setup {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("out of operation contexts (limit {limit})")]
    OutOfContexts { limit: usize },
    #[error("{operation} is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error("send failed on socket {socket}: {source}")]
    SendFailed {
        socket: RawFd,
        #[source]
        source: io::Error,
    },
    #[error("completion port is closed")]
    PortClosed,
    #[error("{role} thread panicked")]
    Panicked { role: Role },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for wrapping a setup syscall failure.
    pub(crate) fn setup(stage: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Setup { stage, source }
    }
}
