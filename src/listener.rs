//! Inbound peer connections.
//!
//! Every accepted socket opens with a single init frame: `PeerInit`
//! announces an unsolicited connection and its purpose, `PierceFirewall`
//! answers a solicitation we sent through the server. The listener reads
//! that frame, then hands the socket to the peer connection manager.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{
    Connection, ConnectionError, ConnectionOptions, Direction, Path,
};
use crate::constants::{HANDSHAKE_TIMEOUT, MAX_INIT_FRAME_SIZE};
use crate::message::{ConnectionType, InitMessage};
use crate::peers::PeerConnectionManager;

/// Accepts inbound peer sockets and routes them by their init frame.
pub struct Listener {
    listener: TcpListener,
    port: u16,
}

impl Listener {
    /// Binds the listen socket. Port 0 picks an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| ConnectionError::Connect(e.to_string()))?
            .port();
        info!("listener bound on port {}", port);
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The accept loop. Each socket gets its own task for the handshake so
    /// a slow peer cannot stall accepts.
    pub async fn run(self, manager: Arc<PeerConnectionManager>) -> Result<(), ConnectionError> {
        loop {
            let (stream, addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| ConnectionError::Read(e.to_string()))?;
            let manager = manager.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_inbound(stream, addr, manager).await {
                    debug!("inbound connection from {} rejected: {}", addr, e);
                }
            });
        }
    }
}

/// Reads the init frame off a fresh socket and dispatches it.
async fn handle_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    manager: Arc<PeerConnectionManager>,
) -> Result<(), ConnectionError> {
    let connection = Connection::from_stream(
        stream,
        Direction::Inbound,
        Path::Direct,
        ConnectionOptions::default(),
    )?;

    let init = match timeout(HANDSHAKE_TIMEOUT, read_init(&connection)).await {
        Ok(Ok(init)) => init,
        Ok(Err(e)) => {
            connection.disconnect("bad handshake").await;
            return Err(e);
        }
        Err(_) => {
            connection.disconnect("handshake timeout").await;
            return Err(ConnectionError::Timeout);
        }
    };

    // Promote the raw accepted socket: the manager wraps it for the role
    // the handshake declared.
    let stream = connection.handoff().await?;

    match init {
        InitMessage::PeerInit {
            username,
            connection_type: ConnectionType::Transfer,
            token,
        } => {
            debug!("inbound transfer connection from {} at {} (token {})", username, addr, token);
            manager.add_transfer_connection(&username, token, stream).await?;
        }
        InitMessage::PeerInit {
            username,
            connection_type,
            ..
        } => {
            debug!("inbound {} connection from {} at {}", connection_type, username, addr);
            manager.add_message_connection(&username, stream).await?;
        }
        InitMessage::PierceFirewall { token } => {
            debug!("inbound pierce firewall from {} (token {})", addr, token);
            if let Err(e) = manager.pierce_firewall(token, stream).await {
                warn!("unmatched pierce firewall from {}: {}", addr, e);
                return Err(e);
            }
        }
    }
    Ok(())
}

async fn read_init(connection: &Connection) -> Result<InitMessage, ConnectionError> {
    let cancel = CancellationToken::new();
    let prefix = connection.read(4, &cancel).await?;
    let length = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if length == 0 || length > MAX_INIT_FRAME_SIZE {
        return Err(ConnectionError::Protocol(format!(
            "implausible init frame length {}",
            length
        )));
    }
    let body = connection.read(length, &cancel).await?;
    Ok(InitMessage::decode(Bytes::from(body))?)
}
