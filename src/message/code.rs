use crate::codec::CodecError;

/// Message codes in the server code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServerCode {
    /// Log in to the server.
    Login = 1,
    /// Advertise our peer listen port.
    SetListenPort = 2,
    /// Resolve a username to an IP and port.
    GetPeerAddress = 3,
    /// Watch a user for status changes.
    AddUser = 5,
    /// Query a user's online status.
    GetStatus = 7,
    /// Ask the server to tell a peer to connect back to us.
    ConnectToPeer = 18,
    /// A private chat message.
    PrivateMessage = 22,
    /// Acknowledge receipt of a private message.
    AcknowledgePrivateMessage = 23,
    /// Start a network-wide file search.
    FileSearch = 26,
    /// Set our own online status.
    SetOnlineStatus = 28,
    /// Report how much we share.
    SharedFoldersAndFiles = 35,
}

impl From<ServerCode> for u32 {
    fn from(code: ServerCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for ServerCode {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ServerCode::Login),
            2 => Ok(ServerCode::SetListenPort),
            3 => Ok(ServerCode::GetPeerAddress),
            5 => Ok(ServerCode::AddUser),
            7 => Ok(ServerCode::GetStatus),
            18 => Ok(ServerCode::ConnectToPeer),
            22 => Ok(ServerCode::PrivateMessage),
            23 => Ok(ServerCode::AcknowledgePrivateMessage),
            26 => Ok(ServerCode::FileSearch),
            28 => Ok(ServerCode::SetOnlineStatus),
            35 => Ok(ServerCode::SharedFoldersAndFiles),
            actual => Err(CodecError::CodeMismatch { expected: 0, actual }),
        }
    }
}

/// Message codes in the peer code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PeerCode {
    /// Request the peer's share listing.
    BrowseRequest = 4,
    /// The share listing; payload is compressed.
    BrowseResponse = 5,
    /// Search this peer's shares.
    SearchRequest = 8,
    /// Request user info (description, picture, slots).
    InfoRequest = 15,
    /// Ask where a queued file sits in the peer's queue.
    PlaceInQueueRequest = 51,
}

impl From<PeerCode> for u32 {
    fn from(code: PeerCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for PeerCode {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(PeerCode::BrowseRequest),
            5 => Ok(PeerCode::BrowseResponse),
            8 => Ok(PeerCode::SearchRequest),
            15 => Ok(PeerCode::InfoRequest),
            51 => Ok(PeerCode::PlaceInQueueRequest),
            actual => Err(CodecError::CodeMismatch { expected: 0, actual }),
        }
    }
}

/// Message codes in the distributed code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DistributedCode {
    /// A search request relayed through the distributed network.
    SearchRequest = 3,
}

impl From<DistributedCode> for u32 {
    fn from(code: DistributedCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for DistributedCode {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(DistributedCode::SearchRequest),
            actual => Err(CodecError::CodeMismatch { expected: 3, actual }),
        }
    }
}

/// Single-byte codes of the connection-init space, written raw on a fresh
/// peer socket before any framed traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitCode {
    /// The peer is answering our solicitation; carries our token.
    PierceFirewall = 0,
    /// An unsolicited connection announcing username, type, and token.
    PeerInit = 1,
}

impl From<InitCode> for u8 {
    fn from(code: InitCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for InitCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(InitCode::PierceFirewall),
            1 => Ok(InitCode::PeerInit),
            actual => Err(CodecError::CodeMismatch {
                expected: InitCode::PeerInit as u32,
                actual: actual as u32,
            }),
        }
    }
}
