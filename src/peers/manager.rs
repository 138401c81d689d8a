use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::pending::{PendingSolicitations, SolicitationGuard};
use super::slot::{Slot, SlotResult};
use crate::connection::{
    Connection, ConnectionError, ConnectionOptions, Direction, MessageConnection, MessageRead,
    Path,
};
use crate::constants::DEFAULT_WAIT_TIMEOUT;
use crate::message::{ConnectToPeerResponse, ConnectionType, InitMessage, ServerRequest};
use crate::waiter::{WaitKey, Waiter};

/// Tuning for the manager and the connections it creates.
#[derive(Debug, Clone)]
pub struct PeerConnectionManagerOptions {
    /// Our own username, announced in `PeerInit` handshakes.
    pub username: String,
    /// Options applied to peer message connections.
    pub message_options: ConnectionOptions,
    /// Options applied to transfer connections.
    pub transfer_options: ConnectionOptions,
    /// Bound on indirect rendezvous and other waits.
    pub wait_timeout: Duration,
}

impl PeerConnectionManagerOptions {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            message_options: ConnectionOptions::default(),
            transfer_options: ConnectionOptions::transfer(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

enum Claim {
    Existing(MessageConnection),
    Wait(watch::Receiver<Option<SlotResult>>),
    Mine {
        epoch: u64,
        tx: watch::Sender<Option<SlotResult>>,
    },
}

/// Establishes, tracks, supersedes, and tears down peer connections.
///
/// Message connections are cached one per username, the cached one always
/// being the most recently established; transfer connections are created
/// per transfer and never cached. Outbound solicitations go out through
/// the server request sender handed in at construction; frames read from
/// peer connections come back on the message channel.
pub struct PeerConnectionManager {
    options: PeerConnectionManagerOptions,
    waiter: Arc<Waiter>,
    server_tx: mpsc::UnboundedSender<ServerRequest>,
    message_tx: mpsc::UnboundedSender<MessageRead>,
    connections: Mutex<HashMap<String, Slot>>,
    pending: PendingSolicitations,
    next_token: AtomicU32,
    next_epoch: AtomicU64,
    shutdown: CancellationToken,
}

impl PeerConnectionManager {
    pub fn new(
        options: PeerConnectionManagerOptions,
        waiter: Arc<Waiter>,
        server_tx: mpsc::UnboundedSender<ServerRequest>,
        message_tx: mpsc::UnboundedSender<MessageRead>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            waiter,
            server_tx,
            message_tx,
            connections: Mutex::new(HashMap::new()),
            pending: PendingSolicitations::new(),
            // Seeded randomly so tokens from consecutive runs don't collide
            // at the peer; uniqueness only matters across open waiters.
            next_token: AtomicU32::new(rand::random()),
            next_epoch: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Allocates a fresh solicitation token. Wrapping is acceptable.
    pub fn next_token(&self) -> u32 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// True if a live message connection for `username` is cached.
    pub fn has_message_connection(&self, username: &str) -> bool {
        matches!(
            self.connections.lock().get(username),
            Some(Slot::Ready { connection, .. }) if connection.connection().is_connected()
        )
    }

    /// Number of solicitations awaiting a `PierceFirewall`.
    pub fn pending_solicitations(&self) -> usize {
        self.pending.len()
    }

    /// The user an outstanding solicitation token belongs to.
    pub fn solicited_username(&self, token: u32) -> Option<String> {
        self.pending.username_for(token)
    }

    /// Returns the cached message connection for `username`, or
    /// establishes one by racing a direct connect against an indirect
    /// solicitation. Concurrent callers for the same user share one
    /// in-flight attempt.
    pub async fn get_or_add_message_connection(
        self: &Arc<Self>,
        username: &str,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<MessageConnection, ConnectionError> {
        self.ensure_active()?;
        match self.claim(username) {
            Claim::Existing(connection) => Ok(connection),
            Claim::Wait(rx) => Self::await_slot(rx).await,
            Claim::Mine { epoch, tx } => {
                let result = self.establish_message_connection(username, addr, cancel).await;
                let result = self.finish_slot(username, epoch, result);
                let _ = tx.send(Some(result.clone()));
                result
            }
        }
    }

    /// The solicited path: a received `ConnectToPeer` of type "P" names a
    /// peer that wants a message channel with us. Connect to the
    /// advertised endpoint and answer with `PierceFirewall` carrying the
    /// peer's token.
    pub async fn get_or_add_message_connection_from_response(
        self: &Arc<Self>,
        response: &ConnectToPeerResponse,
        cancel: &CancellationToken,
    ) -> Result<MessageConnection, ConnectionError> {
        self.ensure_active()?;
        match self.claim(&response.username) {
            Claim::Existing(connection) => Ok(connection),
            Claim::Wait(rx) => Self::await_slot(rx).await,
            Claim::Mine { epoch, tx } => {
                let result = self.establish_solicited_connection(response, cancel).await;
                let result = self.finish_slot(&response.username, epoch, result);
                let _ = tx.send(Some(result.clone()));
                result
            }
        }
    }

    /// Absorbs an inbound message connection identified by the listener.
    /// If a connection for this user is already cached, the new one
    /// supersedes it: both endpoints converge on "most recent wins".
    pub async fn add_message_connection(
        self: &Arc<Self>,
        username: &str,
        stream: TcpStream,
    ) -> Result<MessageConnection, ConnectionError> {
        self.ensure_active()?;
        let connection = Connection::from_stream(
            stream,
            Direction::Inbound,
            Path::Direct,
            self.options.message_options.clone(),
        )?;
        let message_connection = MessageConnection::new(connection, username);
        message_connection.start_read_loop(self.message_tx.clone());

        let previous = self.connections.lock().insert(
            username.to_string(),
            Slot::Ready {
                connection: message_connection.clone(),
            },
        );
        if let Some(Slot::Ready { connection: old, .. }) = previous {
            if old.connection().id() != message_connection.connection().id() {
                info!("inbound connection from {} supersedes cached connection", username);
                tokio::spawn(async move {
                    old.connection().disconnect("superseded by newer connection").await;
                });
            }
        }
        self.monitor(username, message_connection.clone());
        debug!("inbound peer message connection added for {}", username);
        Ok(message_connection)
    }

    /// Establishes an outbound transfer connection for `token`, racing
    /// direct against indirect like the message path. The token is written
    /// as a 4-byte preamble so the remote listener can correlate; transfer
    /// connections are not cached.
    pub async fn get_transfer_connection(
        &self,
        username: &str,
        addr: SocketAddr,
        token: u32,
        cancel: &CancellationToken,
    ) -> Result<Connection, ConnectionError> {
        self.ensure_active()?;
        let (connection, path) = self
            .race(username, ConnectionType::Transfer, addr, cancel)
            .await?;
        let preamble = async {
            if path == Path::Direct {
                let init = InitMessage::peer_init(
                    &self.options.username,
                    ConnectionType::Transfer,
                    token,
                );
                connection.write(&init.encode(), cancel).await?;
            }
            connection.write(&token.to_le_bytes(), cancel).await
        };
        if let Err(e) = preamble.await {
            connection.disconnect("handshake failed").await;
            return Err(e);
        }
        debug!("transfer connection to {} established ({:?}, token {})", username, path, token);
        Ok(connection)
    }

    /// The solicited transfer path: connect to the endpoint a
    /// `ConnectToPeer` of type "F" advertised, answer `PierceFirewall`,
    /// read the peer's 4-byte token, and complete the transfer waiter with
    /// the connection. Returns the remote token.
    pub async fn get_transfer_connection_from_response(
        &self,
        response: &ConnectToPeerResponse,
        cancel: &CancellationToken,
    ) -> Result<u32, ConnectionError> {
        self.ensure_active()?;
        let connection = Connection::new(
            response.endpoint(),
            Direction::Outbound,
            Path::Indirect,
            self.options.transfer_options.clone(),
        );
        connection.connect(cancel).await?;
        let exchange = async {
            connection
                .write(&InitMessage::pierce_firewall(response.token).encode(), cancel)
                .await?;
            connection.read(4, cancel).await
        };
        let bytes = match exchange.await {
            Ok(bytes) => bytes,
            Err(e) => {
                connection.disconnect("handshake failed").await;
                return Err(e);
            }
        };
        let remote_token = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        debug!(
            "solicited transfer connection to {} established (remote token {})",
            response.username, remote_token,
        );
        self.waiter.complete(
            &WaitKey::direct_transfer(&response.username, remote_token),
            connection,
        );
        Ok(remote_token)
    }

    /// Absorbs an inbound transfer connection identified by the listener:
    /// reads the peer's 4-byte token preamble and completes the waiter the
    /// downloading caller is blocked on.
    pub async fn add_transfer_connection(
        &self,
        username: &str,
        _their_token: u32,
        stream: TcpStream,
    ) -> Result<(), ConnectionError> {
        self.ensure_active()?;
        let connection = Connection::from_stream(
            stream,
            Direction::Inbound,
            Path::Direct,
            self.options.transfer_options.clone(),
        )?;
        let child_token = self.shutdown.child_token();
        let preamble = tokio::time::timeout(
            self.options.wait_timeout,
            connection.read(4, &child_token),
        );
        let bytes = match preamble.await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                connection.disconnect("token preamble timeout").await;
                return Err(ConnectionError::Timeout);
            }
        };
        let remote_token = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        debug!("inbound transfer connection from {} (remote token {})", username, remote_token);
        self.waiter
            .complete(&WaitKey::direct_transfer(username, remote_token), connection);
        Ok(())
    }

    /// Blocks until the transfer connection bearing `remote_token` arrives
    /// from `username`, inbound or solicited.
    pub async fn await_transfer_connection(
        &self,
        username: &str,
        remote_token: u32,
        cancel: &CancellationToken,
    ) -> Result<Connection, ConnectionError> {
        let wait = self.waiter.wait(
            WaitKey::direct_transfer(username, remote_token),
            Some(self.options.wait_timeout),
            cancel,
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ConnectionError::Cancelled),
            result = wait => result,
        }
    }

    /// Resolves an inbound `PierceFirewall`: the token recovers the user
    /// we solicited, and the socket completes that solicitation's waiter.
    pub async fn pierce_firewall(
        &self,
        token: u32,
        stream: TcpStream,
    ) -> Result<(), ConnectionError> {
        match self.pending.username_for(token) {
            Some(username) => {
                debug!("pierce firewall {} resolved solicitation for {}", token, username);
                self.waiter
                    .complete(&WaitKey::solicited_connection(&username, token), stream);
                Ok(())
            }
            None => Err(ConnectionError::Protocol(format!(
                "no pending solicitation for token {}",
                token
            ))),
        }
    }

    /// Clears the pending-solicitation map, faults every outstanding wait,
    /// and drains the cache, disposing every connection.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        self.pending.clear();
        self.waiter.cancel_all();
        let slots: Vec<Slot> = {
            let mut map = self.connections.lock();
            map.drain().map(|(_, slot)| slot).collect()
        };
        futures::future::join_all(slots.into_iter().filter_map(|slot| match slot {
            Slot::Ready { connection, .. } => Some(async move {
                connection.connection().disconnect("manager disposed").await;
            }),
            Slot::InFlight { .. } => None,
        }))
        .await;
        info!("peer connection manager disposed");
    }

    fn ensure_active(&self) -> Result<(), ConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }
        Ok(())
    }

    fn claim(&self, username: &str) -> Claim {
        let mut map = self.connections.lock();
        match map.get(username) {
            Some(Slot::Ready { connection, .. }) if connection.connection().is_connected() => {
                Claim::Existing(connection.clone())
            }
            Some(Slot::InFlight { rx, .. }) => Claim::Wait(rx.clone()),
            _ => {
                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                map.insert(username.to_string(), Slot::InFlight { epoch, rx });
                Claim::Mine { epoch, tx }
            }
        }
    }

    async fn await_slot(mut rx: watch::Receiver<Option<SlotResult>>) -> SlotResult {
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            rx.changed()
                .await
                .map_err(|_| ConnectionError::Connect("connection attempt abandoned".into()))?;
        }
    }

    /// Commits an establishment's outcome to the slot. If an inbound
    /// connection superseded the slot while this attempt ran, the attempt's
    /// connection is disposed and the superseding one returned, keeping the
    /// cache at one live connection per user.
    fn finish_slot(self: &Arc<Self>, username: &str, epoch: u64, result: SlotResult) -> SlotResult {
        match result {
            Ok(connection) => {
                enum Outcome {
                    Committed,
                    Superseded(Option<MessageConnection>),
                }
                let outcome = {
                    let mut map = self.connections.lock();
                    let still_mine = matches!(
                        map.get(username),
                        Some(Slot::InFlight { epoch: current, .. }) if *current == epoch
                    );
                    if still_mine {
                        map.insert(
                            username.to_string(),
                            Slot::Ready {
                                connection: connection.clone(),
                            },
                        );
                        Outcome::Committed
                    } else {
                        match map.get(username) {
                            Some(Slot::Ready { connection: winner, .. }) => {
                                Outcome::Superseded(Some(winner.clone()))
                            }
                            _ => Outcome::Superseded(None),
                        }
                    }
                };
                match outcome {
                    Outcome::Committed => {
                        self.monitor(username, connection.clone());
                        Ok(connection)
                    }
                    Outcome::Superseded(winner) => {
                        debug!("establishment for {} lost to a superseding connection", username);
                        tokio::spawn(async move {
                            connection.connection().disconnect("superseded").await;
                        });
                        winner.ok_or_else(|| {
                            ConnectionError::Connect("connection superseded".into())
                        })
                    }
                }
            }
            Err(e) => {
                // Remove the failed slot so a later call can retry.
                let mut map = self.connections.lock();
                let still_mine = matches!(
                    map.get(username),
                    Some(Slot::InFlight { epoch: current, .. }) if *current == epoch
                );
                if still_mine {
                    map.remove(username);
                }
                Err(e)
            }
        }
    }

    /// Evicts the slot when this exact connection closes. Comparing ids
    /// keeps a superseding connection safe from its predecessor's eviction.
    fn monitor(self: &Arc<Self>, username: &str, connection: MessageConnection) {
        let username = username.to_string();
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            connection.connection().closed().await;
            if let Some(manager) = manager.upgrade() {
                let mut map = manager.connections.lock();
                let is_current = matches!(
                    map.get(&username),
                    Some(Slot::Ready { connection: cached, .. })
                        if cached.connection().id() == connection.connection().id()
                );
                if is_current {
                    map.remove(&username);
                    debug!("evicted closed connection for {}", username);
                }
            }
        });
    }

    async fn establish_message_connection(
        &self,
        username: &str,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> SlotResult {
        let (connection, path) = self
            .race(username, ConnectionType::Peer, addr, cancel)
            .await?;
        let message_connection = MessageConnection::new(connection, username);
        if path == Path::Direct {
            // The direct side opens with our identity; the indirect side's
            // peer has already handshaken via PierceFirewall.
            let init = InitMessage::peer_init(
                &self.options.username,
                ConnectionType::Peer,
                self.next_token(),
            );
            if let Err(e) = message_connection.write_frame(init.encode(), cancel).await {
                message_connection
                    .connection()
                    .disconnect("handshake failed")
                    .await;
                return Err(e);
            }
        }
        message_connection.start_read_loop(self.message_tx.clone());
        debug!("peer message connection to {} established ({:?})", username, path);
        Ok(message_connection)
    }

    async fn establish_solicited_connection(
        &self,
        response: &ConnectToPeerResponse,
        cancel: &CancellationToken,
    ) -> SlotResult {
        let connection = Connection::new(
            response.endpoint(),
            Direction::Outbound,
            Path::Indirect,
            self.options.message_options.clone(),
        );
        connection.connect(cancel).await?;
        let message_connection = MessageConnection::new(connection, &response.username);
        if let Err(e) = message_connection
            .write_frame(InitMessage::pierce_firewall(response.token).encode(), cancel)
            .await
        {
            message_connection
                .connection()
                .disconnect("handshake failed")
                .await;
            return Err(e);
        }
        message_connection.start_read_loop(self.message_tx.clone());
        debug!(
            "solicited peer message connection to {} established",
            response.username,
        );
        Ok(message_connection)
    }

    /// Races a direct connect against an indirect solicitation. The first
    /// branch to succeed wins and the other is cancelled by drop; a branch
    /// failing first defers to the other, and only both failing raises.
    async fn race(
        &self,
        username: &str,
        connection_type: ConnectionType,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<(Connection, Path), ConnectionError> {
        let options = match connection_type {
            ConnectionType::Transfer => &self.options.transfer_options,
            _ => &self.options.message_options,
        };

        let direct = async {
            let connection =
                Connection::new(addr, Direction::Outbound, Path::Direct, options.clone());
            connection.connect(cancel).await?;
            Ok::<_, ConnectionError>(connection)
        };
        let indirect = self.solicit_indirect(username, connection_type, options, cancel);
        tokio::pin!(direct);
        tokio::pin!(indirect);

        tokio::select! {
            result = &mut direct => match result {
                Ok(connection) => Ok((connection, Path::Direct)),
                Err(direct_err) => match indirect.await {
                    Ok(connection) => Ok((connection, Path::Indirect)),
                    Err(indirect_err) => Err(both_failed(direct_err, indirect_err)),
                },
            },
            result = &mut indirect => match result {
                Ok(connection) => Ok((connection, Path::Indirect)),
                Err(indirect_err) => match direct.await {
                    Ok(connection) => Ok((connection, Path::Direct)),
                    Err(direct_err) => Err(both_failed(direct_err, indirect_err)),
                },
            },
        }
    }

    /// The indirect branch: allocate a token, ask the server to have the
    /// peer connect back, and wait for the listener to deliver the socket
    /// bearing that token. The pending entry is removed on every exit.
    async fn solicit_indirect(
        &self,
        username: &str,
        connection_type: ConnectionType,
        options: &ConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Connection, ConnectionError> {
        let token = self.next_token();
        self.pending.insert(token, username);
        let _guard = SolicitationGuard::new(&self.pending, token);

        self.server_tx
            .send(ServerRequest::ConnectToPeer {
                token,
                username: username.to_string(),
                connection_type,
            })
            .map_err(|_| ConnectionError::Connect("server connection unavailable".into()))?;
        debug!("solicited indirect {} connection to {} (token {})", connection_type, username, token);

        let wait = self.waiter.wait(
            WaitKey::solicited_connection(username, token),
            Some(self.options.wait_timeout),
            cancel,
        );
        // Watch disposal as well, so a wait racing cancel_all still ends.
        let stream: TcpStream = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ConnectionError::Cancelled),
            result = wait => result?,
        };
        Connection::from_stream(stream, Direction::Outbound, Path::Indirect, options.clone())
    }
}

fn both_failed(direct: ConnectionError, indirect: ConnectionError) -> ConnectionError {
    if direct == ConnectionError::Cancelled || indirect == ConnectionError::Cancelled {
        return ConnectionError::Cancelled;
    }
    ConnectionError::Connect(format!("direct: {}; indirect: {}", direct, indirect))
}
