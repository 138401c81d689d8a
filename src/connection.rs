//! Peer and server TCP connections.
//!
//! A [`Connection`] is a single socket with a connect-state machine, an
//! inactivity timer, and a watchdog that tears down half-open sockets. It
//! reads and writes raw bytes and is what file transfers ride on. A
//! [`MessageConnection`] layers frame-at-a-time I/O on top and carries the
//! identity of the peer it speaks for.

mod error;
mod message;
mod options;
mod raw;

pub use error::ConnectionError;
pub use message::{MessageConnection, MessageRead};
pub use options::ConnectionOptions;
pub use raw::{Connection, ConnectionEvent, ConnectionState, Direction, Path};
