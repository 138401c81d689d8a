use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::ConnectionError;
use super::raw::Connection;
use crate::constants::MAX_FRAME_SIZE;

/// One decoded frame delivered by a continuous reader, tagged with the
/// identity of the connection it arrived on.
#[derive(Debug, Clone)]
pub struct MessageRead {
    pub username: String,
    pub connection_id: u64,
    /// The frame body: message code and payload, length prefix stripped.
    pub frame: Bytes,
}

type MessageHook = Box<dyn Fn(&Bytes) + Send + Sync>;

/// A [`Connection`] specialized to frame-level I/O, carrying the username
/// of the peer it speaks for.
///
/// Frames are written whole under the connection's write lock, so
/// concurrent senders never interleave. [`start_read_loop`] spawns the
/// continuous reader that emits one [`MessageRead`] per frame in strict
/// wire order; on the outbound direct path it is deferred until after the
/// `PeerInit` handshake has been written.
///
/// [`start_read_loop`]: MessageConnection::start_read_loop
#[derive(Clone)]
pub struct MessageConnection {
    connection: Connection,
    username: Arc<str>,
    reading: Arc<AtomicBool>,
    hook: Arc<Mutex<Option<MessageHook>>>,
}

impl std::fmt::Debug for MessageConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConnection")
            .field("username", &self.username)
            .field("reading", &self.reading)
            .finish_non_exhaustive()
    }
}

impl MessageConnection {
    pub fn new(connection: Connection, username: impl Into<String>) -> Self {
        Self {
            connection,
            username: username.into().into(),
            reading: Arc::new(AtomicBool::new(false)),
            hook: Arc::new(Mutex::new(None)),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Installs a hook invoked synchronously on each frame before it is
    /// queued to the reader's channel.
    pub fn set_message_hook(&self, hook: MessageHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Writes one pre-built frame (length prefix included).
    pub async fn write_frame(
        &self,
        frame: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        self.connection.write(&frame, cancel).await
    }

    /// Reads one frame and returns its body, length prefix stripped.
    pub async fn read_frame(&self, cancel: &CancellationToken) -> Result<Bytes, ConnectionError> {
        let prefix = self.connection.read(4, cancel).await?;
        let length = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            let reason = format!("frame length {} exceeds limit", length);
            self.connection.disconnect(&reason).await;
            return Err(ConnectionError::Protocol(reason));
        }
        let body = self.connection.read(length, cancel).await?;
        Ok(Bytes::from(body))
    }

    /// Spawns the continuous reader. Idempotent; the loop runs until the
    /// connection tears down or the receiving side of `tx` goes away.
    pub fn start_read_loop(&self, tx: mpsc::UnboundedSender<MessageRead>) {
        if self.reading.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            loop {
                let frame = match this.read_frame(&cancel).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        trace!("read loop for {} ended: {}", this.username, e);
                        break;
                    }
                };
                if let Some(hook) = this.hook.lock().as_ref() {
                    hook(&frame);
                }
                let read = MessageRead {
                    username: this.username.to_string(),
                    connection_id: this.connection.id(),
                    frame,
                };
                if tx.send(read).is_err() {
                    debug!("message channel for {} closed, dropping connection", this.username);
                    this.connection.disconnect("message handler dropped").await;
                    break;
                }
            }
        });
    }
}
