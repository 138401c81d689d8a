//! Typed messages over the framing codec.
//!
//! Message codes are distinct integers per code space: server, peer, and
//! distributed codes are 4 bytes; the connection-init space used for the
//! first frame on a fresh peer socket is a single byte. This module
//! carries a representative catalog of typed messages; frames with codes
//! outside it decode to raw `Unknown` variants rather than failing the
//! connection.

mod code;
mod distributed;
mod init;
mod peer;
mod server;

pub use code::{DistributedCode, InitCode, PeerCode, ServerCode};
pub use distributed::DistributedMessage;
pub use init::{ConnectionType, InitMessage};
pub use peer::{BrowseResponse, PeerMessage};
pub use server::{
    ConnectToPeerResponse, LoginResponse, PrivateMessage, ServerRequest, ServerResponse,
    UserAddressResponse, UserStatus,
};
