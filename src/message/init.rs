use std::fmt;

use bytes::Bytes;

use super::code::InitCode;
use crate::codec::{CodecError, MessageReader, MessageWriter};

/// The declared purpose of a peer connection, carried as a one-character
/// string in the init handshake and in `ConnectToPeer` solicitations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// "P": a peer message channel.
    Peer,
    /// "F": a file transfer byte pipe.
    Transfer,
    /// "D": a distributed-search channel.
    Distributed,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Peer => "P",
            ConnectionType::Transfer => "F",
            ConnectionType::Distributed => "D",
        }
    }

    pub fn from_str(value: &str) -> Result<Self, CodecError> {
        match value {
            "P" => Ok(ConnectionType::Peer),
            "F" => Ok(ConnectionType::Transfer),
            "D" => Ok(ConnectionType::Distributed),
            other => Err(CodecError::CodeMismatch {
                expected: b'P' as u32,
                actual: other.bytes().next().unwrap_or(0) as u32,
            }),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first frame on every fresh peer socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitMessage {
    /// An unsolicited direct connection from a peer.
    PeerInit {
        /// The connecting peer's username.
        username: String,
        /// What the connection is for.
        connection_type: ConnectionType,
        /// The peer's token for this connection.
        token: u32,
    },
    /// The peer is answering a solicitation we sent through the server;
    /// the token is the one we allocated.
    PierceFirewall { token: u32 },
}

impl InitMessage {
    pub fn peer_init(
        username: impl Into<String>,
        connection_type: ConnectionType,
        token: u32,
    ) -> Self {
        InitMessage::PeerInit {
            username: username.into(),
            connection_type,
            token,
        }
    }

    pub fn pierce_firewall(token: u32) -> Self {
        InitMessage::PierceFirewall { token }
    }

    /// Encodes the full frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        match self {
            InitMessage::PeerInit {
                username,
                connection_type,
                token,
            } => {
                let mut writer = MessageWriter::init(InitCode::PeerInit.into());
                writer
                    .write_string(username)
                    .write_string(connection_type.as_str())
                    .write_u32(*token);
                writer.build()
            }
            InitMessage::PierceFirewall { token } => {
                let mut writer = MessageWriter::init(InitCode::PierceFirewall.into());
                writer.write_u32(*token);
                writer.build()
            }
        }
    }

    /// Decodes a frame body (the bytes after the length prefix).
    pub fn decode(body: Bytes) -> Result<Self, CodecError> {
        let mut reader = MessageReader::new(body);
        match InitCode::try_from(reader.read_init_code()?)? {
            InitCode::PeerInit => {
                let username = reader.read_string()?;
                let connection_type = ConnectionType::from_str(&reader.read_string()?)?;
                let token = reader.read_u32()?;
                Ok(InitMessage::PeerInit {
                    username,
                    connection_type,
                    token,
                })
            }
            InitCode::PierceFirewall => Ok(InitMessage::PierceFirewall {
                token: reader.read_u32()?,
            }),
        }
    }
}
