//! Socket handles.
//!
//! The only networking type is [`Socket`], an owned descriptor. All traffic
//! on it goes through the reactor as completion-based operations.

mod socket;

pub use socket::{Socket, TcpState};
