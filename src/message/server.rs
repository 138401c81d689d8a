use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::Bytes;
use md5::{Digest, Md5};

use super::code::ServerCode;
use super::init::ConnectionType;
use crate::codec::{CodecError, MessageReader, MessageWriter};
use crate::constants::{CLIENT_MINOR_VERSION, CLIENT_VERSION};

/// A user's online status as reported to and by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UserStatus {
    Offline = 0,
    Away = 1,
    Online = 2,
}

impl From<u32> for UserStatus {
    fn from(value: u32) -> Self {
        match value {
            1 => UserStatus::Away,
            2 => UserStatus::Online,
            _ => UserStatus::Offline,
        }
    }
}

/// Requests we send to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    /// Log in. The digest field of the wire message is computed here.
    Login { username: String, password: String },
    /// Advertise the port our listener is bound to.
    SetListenPort(u16),
    /// Resolve a username to an endpoint.
    GetPeerAddress(String),
    /// Watch a user.
    AddUser(String),
    /// Query a user's status.
    GetStatus(String),
    /// Ask the server to tell `username` to connect back to us with
    /// `token`; the peer echoes the token in its `PierceFirewall`.
    ConnectToPeer {
        token: u32,
        username: String,
        connection_type: ConnectionType,
    },
    /// Acknowledge a private message by id.
    AcknowledgePrivateMessage(u32),
    /// Start a network-wide search correlated by token.
    FileSearch { token: u32, query: String },
    /// Set our own status.
    SetOnlineStatus(UserStatus),
    /// Report share counts.
    SharedFoldersAndFiles { directories: u32, files: u32 },
}

impl ServerRequest {
    pub fn code(&self) -> ServerCode {
        match self {
            ServerRequest::Login { .. } => ServerCode::Login,
            ServerRequest::SetListenPort(_) => ServerCode::SetListenPort,
            ServerRequest::GetPeerAddress(_) => ServerCode::GetPeerAddress,
            ServerRequest::AddUser(_) => ServerCode::AddUser,
            ServerRequest::GetStatus(_) => ServerCode::GetStatus,
            ServerRequest::ConnectToPeer { .. } => ServerCode::ConnectToPeer,
            ServerRequest::AcknowledgePrivateMessage(_) => {
                ServerCode::AcknowledgePrivateMessage
            }
            ServerRequest::FileSearch { .. } => ServerCode::FileSearch,
            ServerRequest::SetOnlineStatus(_) => ServerCode::SetOnlineStatus,
            ServerRequest::SharedFoldersAndFiles { .. } => ServerCode::SharedFoldersAndFiles,
        }
    }

    /// Encodes the full frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut writer = MessageWriter::new(self.code().into());
        match self {
            ServerRequest::Login { username, password } => {
                let digest = Md5::digest(format!("{}{}", username, password).as_bytes());
                let digest_hex: String =
                    digest.iter().map(|b| format!("{:02x}", b)).collect();
                writer
                    .write_string(username)
                    .write_string(password)
                    .write_u32(CLIENT_VERSION)
                    .write_string(&digest_hex)
                    .write_u32(CLIENT_MINOR_VERSION);
            }
            ServerRequest::SetListenPort(port) => {
                writer.write_u32(*port as u32);
            }
            ServerRequest::GetPeerAddress(username)
            | ServerRequest::AddUser(username)
            | ServerRequest::GetStatus(username) => {
                writer.write_string(username);
            }
            ServerRequest::ConnectToPeer {
                token,
                username,
                connection_type,
            } => {
                writer
                    .write_u32(*token)
                    .write_string(username)
                    .write_string(connection_type.as_str());
            }
            ServerRequest::AcknowledgePrivateMessage(id) => {
                writer.write_u32(*id);
            }
            ServerRequest::FileSearch { token, query } => {
                writer.write_u32(*token).write_string(query);
            }
            ServerRequest::SetOnlineStatus(status) => {
                writer.write_u32(*status as u32);
            }
            ServerRequest::SharedFoldersAndFiles { directories, files } => {
                writer.write_u32(*directories).write_u32(*files);
            }
        }
        writer.build()
    }
}

/// The server's answer to a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub succeeded: bool,
    /// Greeting on success, rejection reason on failure.
    pub message: String,
    /// Our externally visible address, present on success.
    pub address: Option<Ipv4Addr>,
}

/// A solicitation relayed by the server: a peer wants a connection with
/// us, or is answering ours. We connect to the given endpoint and respond
/// with `PierceFirewall(token)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToPeerResponse {
    pub username: String,
    pub connection_type: ConnectionType,
    pub address: Ipv4Addr,
    pub port: u16,
    pub token: u32,
    pub privileged: bool,
}

impl ConnectToPeerResponse {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

/// Answer to `GetPeerAddress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAddressResponse {
    pub username: String,
    pub address: Ipv4Addr,
    pub port: u16,
}

impl UserAddressResponse {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

/// An incoming private chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub id: u32,
    /// Unix seconds.
    pub timestamp: u32,
    pub username: String,
    pub message: String,
    pub is_admin: bool,
}

/// Messages the server sends us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    Login(LoginResponse),
    ConnectToPeer(ConnectToPeerResponse),
    PeerAddress(UserAddressResponse),
    PrivateMessage(PrivateMessage),
    AddUser { username: String, exists: bool },
    Status { username: String, status: UserStatus, privileged: bool },
    /// A code outside the typed catalog; the frame body is preserved.
    Unknown { code: u32, body: Bytes },
}

impl ServerResponse {
    /// Decodes a frame body (the bytes after the length prefix).
    pub fn decode(body: Bytes) -> Result<Self, CodecError> {
        let mut reader = MessageReader::new(body.clone());
        let raw_code = reader.read_code()?;
        let code = match ServerCode::try_from(raw_code) {
            Ok(code) => code,
            Err(_) => return Ok(ServerResponse::Unknown { code: raw_code, body }),
        };

        match code {
            ServerCode::Login => {
                let succeeded = reader.read_bool()?;
                let message = reader.read_string()?;
                let address = if succeeded && reader.has_more() {
                    Some(reader.read_ip()?)
                } else {
                    None
                };
                Ok(ServerResponse::Login(LoginResponse {
                    succeeded,
                    message,
                    address,
                }))
            }
            ServerCode::ConnectToPeer => {
                let username = reader.read_string()?;
                let connection_type = ConnectionType::from_str(&reader.read_string()?)?;
                let address = reader.read_ip()?;
                let port = reader.read_u32()? as u16;
                let token = reader.read_u32()?;
                let privileged = reader.read_bool()?;
                Ok(ServerResponse::ConnectToPeer(ConnectToPeerResponse {
                    username,
                    connection_type,
                    address,
                    port,
                    token,
                    privileged,
                }))
            }
            ServerCode::GetPeerAddress => {
                let username = reader.read_string()?;
                let address = reader.read_ip()?;
                let port = reader.read_u32()? as u16;
                Ok(ServerResponse::PeerAddress(UserAddressResponse {
                    username,
                    address,
                    port,
                }))
            }
            ServerCode::PrivateMessage => {
                let id = reader.read_u32()?;
                let timestamp = reader.read_u32()?;
                let username = reader.read_string()?;
                let message = reader.read_string()?;
                let is_admin = reader.read_bool()?;
                Ok(ServerResponse::PrivateMessage(PrivateMessage {
                    id,
                    timestamp,
                    username,
                    message,
                    is_admin,
                }))
            }
            ServerCode::AddUser => {
                let username = reader.read_string()?;
                let exists = reader.read_bool()?;
                Ok(ServerResponse::AddUser { username, exists })
            }
            ServerCode::GetStatus => {
                let username = reader.read_string()?;
                let status = UserStatus::from(reader.read_u32()?);
                let privileged = reader.read_bool()?;
                Ok(ServerResponse::Status {
                    username,
                    status,
                    privileged,
                })
            }
            // Codes we only ever send.
            _ => Ok(ServerResponse::Unknown { code: raw_code, body }),
        }
    }
}
