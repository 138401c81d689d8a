//! Binary message framing for the Soulseek wire protocols.
//!
//! Every message on the wire is a frame: a 4-byte little-endian length
//! followed by that many bytes of body. The body opens with a message code
//! (4 bytes in the server, peer, and distributed code spaces; a single byte
//! for the connection-init space) and continues with typed fields. Browse
//! responses additionally carry their payload as a raw deflate stream.

mod error;
mod reader;
mod shares;
mod writer;

pub use error::CodecError;
pub use reader::MessageReader;
pub use shares::{FileAttribute, FileAttributeKind, SharedDirectory, SharedFile};
pub use writer::MessageWriter;
