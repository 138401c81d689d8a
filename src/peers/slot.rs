use tokio::sync::watch;

use crate::connection::{ConnectionError, MessageConnection};

pub(crate) type SlotResult = Result<MessageConnection, ConnectionError>;

/// One cache slot per username. Slots are lazily materialized: the first
/// caller runs the establishment, later callers subscribe to its result.
/// The epoch detects supersession of an in-flight attempt.
pub(crate) enum Slot {
    /// An establishment is running.
    InFlight {
        epoch: u64,
        rx: watch::Receiver<Option<SlotResult>>,
    },
    /// The most recently established live connection for this user.
    Ready { connection: MessageConnection },
}
