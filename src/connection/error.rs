use thiserror::Error;

use super::raw::ConnectionState;
use crate::codec::CodecError;

/// Errors raised by connections, the waiter, and the connection manager.
///
/// Causes are carried as strings so errors stay clonable across the
/// waiter and the in-flight connection slots.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The operation exceeded its deadline.
    #[error("timed out")]
    Timeout,

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A read failed; the connection is torn down.
    #[error("read failed: {0}")]
    Read(String),

    /// A write failed; the connection is torn down.
    #[error("write failed: {0}")]
    Write(String),

    /// The operation is not legal in the connection's current state.
    #[error("invalid state: {0:?}")]
    InvalidState(ConnectionState),

    /// The remote side violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
