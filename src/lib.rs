//! rslsk - a Soulseek client core
//!
//! This library implements the connection management and protocol plumbing
//! at the heart of a Soulseek client: the session protocol spoken to the
//! central server and the peer protocol spoken over many short-lived TCP
//! connections to other users. If a direct connect to a peer fails, the
//! network's firewall-piercing rendezvous asks the server to have the peer
//! connect back; this crate races both paths and keeps whichever lands
//! first.
//!
//! # Modules
//!
//! - [`codec`] - Little-endian length-prefixed framing, typed fields, and
//!   the compressed browse payload
//! - [`message`] - Typed messages in the server, peer, distributed, and
//!   connection-init code spaces
//! - [`connection`] - Raw and frame-level TCP connections with connect
//!   timeout, inactivity watchdog, and a connect-state machine
//! - [`waiter`] - The key → future correlator bridging requests and the
//!   sockets their answers arrive on
//! - [`listener`] - Inbound peer sockets and the init handshake
//! - [`peers`] - The peer connection manager: caching, supersession, and
//!   the direct/indirect connection race
//! - [`server`] - The long-lived server session connection

pub mod codec;
pub mod connection;
pub mod constants;
pub mod listener;
pub mod message;
pub mod peers;
pub mod server;
pub mod waiter;

pub use codec::{CodecError, MessageReader, MessageWriter, SharedDirectory, SharedFile};
pub use connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionOptions, ConnectionState, Direction,
    MessageConnection, MessageRead, Path,
};
pub use listener::Listener;
pub use message::{
    BrowseResponse, ConnectToPeerResponse, ConnectionType, DistributedMessage, InitMessage,
    LoginResponse, PeerMessage, PrivateMessage, ServerRequest, ServerResponse,
    UserAddressResponse, UserStatus,
};
pub use peers::{PeerConnectionManager, PeerConnectionManagerOptions};
pub use server::{ServerConnection, ServerConnectionOptions};
pub use waiter::{WaitKey, Waiter};
