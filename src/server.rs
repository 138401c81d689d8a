//! The long-lived server session connection.
//!
//! One message connection to the Soulseek server carries everything the
//! client does centrally: login, address lookups, and the `ConnectToPeer`
//! solicitations that drive the indirect connection path. Outbound
//! requests are queued through a sender so any component (notably the
//! peer connection manager) can write without owning the connection;
//! inbound messages are decoded and forwarded to the session's handler.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{
    Connection, ConnectionError, ConnectionOptions, Direction, MessageConnection, Path,
};
use crate::constants::{DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT};
use crate::message::{LoginResponse, ServerRequest, ServerResponse, UserAddressResponse};
use crate::waiter::{WaitKey, Waiter};

/// Where and how to reach the server.
#[derive(Debug, Clone)]
pub struct ServerConnectionOptions {
    pub host: String,
    pub port: u16,
    /// The server goes quiet for long stretches; no inactivity teardown.
    pub connection_options: ConnectionOptions,
}

impl Default for ServerConnectionOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
            connection_options: ConnectionOptions {
                inactivity_timeout: None,
                ..ConnectionOptions::default()
            },
        }
    }
}

/// The server session: a single long-lived message connection in the
/// server code space.
pub struct ServerConnection {
    connection: MessageConnection,
    waiter: Arc<Waiter>,
    request_tx: mpsc::UnboundedSender<ServerRequest>,
    /// Waits registered through this session, faulted if the connection
    /// dies while they are outstanding.
    routed_waits: Mutex<HashSet<WaitKey>>,
}

impl ServerConnection {
    /// Connects and starts the reader and writer tasks. Decoded inbound
    /// messages arrive on the returned receiver; request/response pairs
    /// (login, address lookups) additionally resolve through the waiter.
    pub async fn connect(
        options: ServerConnectionOptions,
        waiter: Arc<Waiter>,
        cancel: &CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ServerResponse>), ConnectionError> {
        let addr = tokio::net::lookup_host((options.host.as_str(), options.port))
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?
            .next()
            .ok_or_else(|| {
                ConnectionError::Connect(format!("no address for {}", options.host))
            })?;

        let connection = Connection::new(
            addr,
            Direction::Outbound,
            Path::Direct,
            options.connection_options.clone(),
        );
        connection.connect(cancel).await?;
        info!("connected to server {} at {}", options.host, addr);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            connection: MessageConnection::new(connection, options.host),
            waiter,
            request_tx,
            routed_waits: Mutex::new(HashSet::new()),
        });
        server.spawn_writer(request_rx);
        server.spawn_reader(response_tx);
        Ok((server, response_rx))
    }

    /// The outbound request queue. Senders can be cloned freely; the peer
    /// connection manager holds one for its solicitations.
    pub fn sender(&self) -> mpsc::UnboundedSender<ServerRequest> {
        self.request_tx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.connection().is_connected()
    }

    pub async fn disconnect(&self, reason: &str) {
        self.connection.connection().disconnect(reason).await;
    }

    /// Performs the login exchange.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<LoginResponse, ConnectionError> {
        let request = ServerRequest::Login {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.request_response(WaitKey::login(), request, cancel).await
    }

    /// Resolves a username to its advertised endpoint.
    pub async fn get_peer_address(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<UserAddressResponse, ConnectionError> {
        let request = ServerRequest::GetPeerAddress(username.to_string());
        self.request_response(WaitKey::user_address(username), request, cancel)
            .await
    }

    /// Sends a request and blocks on its wait key, tracking the key so a
    /// dying connection faults the wait with the real cause instead of
    /// leaving the caller to time out.
    async fn request_response<T: Any + Send>(
        &self,
        key: WaitKey,
        request: ServerRequest,
        cancel: &CancellationToken,
    ) -> Result<T, ConnectionError> {
        self.routed_waits.lock().insert(key.clone());
        let result = match self.request_tx.send(request) {
            Ok(()) => self.waiter.wait(key.clone(), None, cancel).await,
            Err(_) => Err(ConnectionError::Write("server writer stopped".into())),
        };
        self.routed_waits.lock().remove(&key);
        result
    }

    fn spawn_writer(self: &Arc<Self>, mut request_rx: mpsc::UnboundedReceiver<ServerRequest>) {
        let server = self.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            while let Some(request) = request_rx.recv().await {
                let code = request.code();
                if let Err(e) = server.connection.write_frame(request.encode(), &cancel).await {
                    warn!("server write of {:?} failed: {}", code, e);
                    break;
                }
                debug!("server request {:?} sent", code);
            }
        });
    }

    fn spawn_reader(self: &Arc<Self>, response_tx: mpsc::UnboundedSender<ServerResponse>) {
        let server = self.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            loop {
                let frame = match server.connection.read_frame(&cancel).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("server read loop ended: {}", e);
                        // Callers blocked on exchanges routed through this
                        // session get the real cause, not a timeout.
                        let keys: Vec<WaitKey> =
                            server.routed_waits.lock().drain().collect();
                        for key in &keys {
                            server.waiter.throw(key, e.clone());
                        }
                        break;
                    }
                };
                let response = match ServerResponse::decode(frame) {
                    Ok(response) => response,
                    Err(e) => {
                        // Codec trouble is reported, not fatal to the session.
                        warn!("undecodable server message: {}", e);
                        continue;
                    }
                };
                match &response {
                    ServerResponse::Login(login) => {
                        server.waiter.complete(&WaitKey::login(), login.clone());
                    }
                    ServerResponse::PeerAddress(address) => {
                        server
                            .waiter
                            .complete(&WaitKey::user_address(&address.username), address.clone());
                    }
                    _ => {}
                }
                if response_tx.send(response).is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::codec::{MessageReader, MessageWriter};
    use crate::message::{ConnectionType, ServerCode};

    async fn read_frame(socket: &mut TcpStream) -> Bytes {
        let mut prefix = [0u8; 4];
        socket.read_exact(&mut prefix).await.unwrap();
        let length = u32::from_le_bytes(prefix) as usize;
        let mut body = vec![0u8; length];
        socket.read_exact(&mut body).await.unwrap();
        Bytes::from(body)
    }

    async fn connect_pair() -> (Arc<ServerConnection>, mpsc::UnboundedReceiver<ServerResponse>, TcpStream)
    {
        let fake_server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = fake_server.local_addr().unwrap().port();

        let options = ServerConnectionOptions {
            host: "127.0.0.1".to_string(),
            port,
            ..ServerConnectionOptions::default()
        };
        let waiter = Arc::new(Waiter::default());
        let cancel = CancellationToken::new();
        let (connected, accepted) = tokio::join!(
            ServerConnection::connect(options, waiter, &cancel),
            fake_server.accept(),
        );
        let (server, responses) = connected.unwrap();
        let (socket, _) = accepted.unwrap();
        (server, responses, socket)
    }

    #[tokio::test]
    async fn test_login_exchange() {
        let (server, _responses, mut socket) = connect_pair().await;

        let login = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .login("alice", "secret", &CancellationToken::new())
                    .await
            }
        });

        // The fake server sees the login request first.
        let body = read_frame(&mut socket).await;
        let mut reader = MessageReader::new(body);
        reader.expect_code(ServerCode::Login.into()).unwrap();
        assert_eq!(reader.read_string().unwrap(), "alice");
        assert_eq!(reader.read_string().unwrap(), "secret");

        // Reply with a greeting.
        let mut writer = MessageWriter::new(ServerCode::Login.into());
        writer
            .write_bool(true)
            .write_string("Welcome to the network")
            .write_ip("1.2.3.4".parse().unwrap());
        socket.write_all(&writer.build()).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), login)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(response.succeeded);
        assert_eq!(response.message, "Welcome to the network");
        assert_eq!(response.address, Some("1.2.3.4".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_connect_to_peer_is_forwarded() {
        let (_server, mut responses, mut socket) = connect_pair().await;

        let mut writer = MessageWriter::new(ServerCode::ConnectToPeer.into());
        writer
            .write_string("bob")
            .write_string("P")
            .write_ip("10.0.0.1".parse().unwrap())
            .write_u32(2234)
            .write_u32(77)
            .write_bool(false);
        socket.write_all(&writer.build()).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), responses.recv())
            .await
            .unwrap()
            .unwrap();
        match response {
            ServerResponse::ConnectToPeer(r) => {
                assert_eq!(r.username, "bob");
                assert_eq!(r.connection_type, ConnectionType::Peer);
                assert_eq!(r.token, 77);
                assert_eq!(r.endpoint().to_string(), "10.0.0.1:2234");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sender_writes_solicitations() {
        let (server, _responses, mut socket) = connect_pair().await;

        server
            .sender()
            .send(ServerRequest::ConnectToPeer {
                token: 505,
                username: "carol".to_string(),
                connection_type: ConnectionType::Transfer,
            })
            .unwrap();

        let body = read_frame(&mut socket).await;
        let mut reader = MessageReader::new(body);
        reader.expect_code(ServerCode::ConnectToPeer.into()).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 505);
        assert_eq!(reader.read_string().unwrap(), "carol");
        assert_eq!(reader.read_string().unwrap(), "F");
    }

    #[tokio::test]
    async fn test_connection_loss_faults_pending_waits() {
        let (server, _responses, mut socket) = connect_pair().await;

        let login = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .login("erin", "secret", &CancellationToken::new())
                    .await
            }
        });

        // Let the request reach the fake server, then kill the connection
        // without answering.
        let _ = read_frame(&mut socket).await;
        drop(socket);

        // The blocked login gets the real read failure, well before the
        // wait timeout would fire.
        let err = tokio::time::timeout(Duration::from_secs(2), login)
            .await
            .expect("pending wait should fault promptly")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Read(_)));
    }

    #[tokio::test]
    async fn test_undecodable_frame_does_not_kill_session() {
        let (server, mut responses, mut socket) = connect_pair().await;

        // A frame whose body is a single stray byte.
        socket.write_all(&[1, 0, 0, 0, 0xFF]).await.unwrap();

        // A well-formed message afterwards still gets through.
        let mut writer = MessageWriter::new(ServerCode::PrivateMessage.into());
        writer
            .write_u32(1)
            .write_u32(1_700_000_000)
            .write_string("dave")
            .write_string("hi")
            .write_bool(false);
        socket.write_all(&writer.build()).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(response, ServerResponse::PrivateMessage(_)));
        assert!(server.is_connected());
    }
}
