use std::time::Duration;

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_INACTIVITY_TIMEOUT, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE,
};

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Largest single read issued against the socket.
    pub read_buffer_size: usize,
    /// Largest single write issued against the socket.
    pub write_buffer_size: usize,
    /// Deadline for the TCP connect.
    pub connect_timeout: Duration,
    /// Tear the connection down after this long without traffic.
    /// `None` disables the inactivity timer; transfers run silent for
    /// long stretches and use `None`.
    pub inactivity_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: READ_BUFFER_SIZE,
            write_buffer_size: WRITE_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            inactivity_timeout: Some(DEFAULT_INACTIVITY_TIMEOUT),
        }
    }
}

impl ConnectionOptions {
    /// Options for transfer connections: no inactivity teardown.
    pub fn transfer() -> Self {
        Self {
            inactivity_timeout: None,
            ..Self::default()
        }
    }
}
