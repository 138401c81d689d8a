//! Protocol constants and tuning parameters.
//!
//! Central catalog of the timeouts, buffer sizes, and protocol values used
//! throughout the crate. Defaults follow what established Soulseek clients
//! ship with.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client major version reported at login.
pub const CLIENT_VERSION: u32 = 160;

/// Client minor version reported at login.
pub const CLIENT_MINOR_VERSION: u32 = 1;

// ============================================================================
// Endpoints
// ============================================================================

/// Default Soulseek server host.
pub const DEFAULT_SERVER_HOST: &str = "server.slsknet.org";

/// Default Soulseek server port.
pub const DEFAULT_SERVER_PORT: u16 = 2242;

/// Default peer listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 2234;

// ============================================================================
// Timeouts
// ============================================================================

/// TCP connect timeout for outbound peer and server connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tear down a peer connection after this long without any read or write.
/// Zero disables the inactivity timer.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound on an unresolved waiter rendezvous.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an accepted socket gets to produce its init frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Watchdog tick; each tick probes the socket for unexpected loss.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Buffer sizes
// ============================================================================

/// Read chunk size for connection reads.
pub const READ_BUFFER_SIZE: usize = 16384;

/// Write chunk size for connection writes.
pub const WRITE_BUFFER_SIZE: usize = 16384;

/// Maximum accepted frame body length. Browse responses from large shares
/// run to tens of megabytes even compressed.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum accepted init frame length. `PeerInit` carries a username, a
/// one-character type string, and a token; anything near this bound is junk.
pub const MAX_INIT_FRAME_SIZE: usize = 4096;
