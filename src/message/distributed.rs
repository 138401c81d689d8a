use bytes::{BufMut, Bytes, BytesMut};

use super::code::DistributedCode;
use crate::codec::{CodecError, MessageReader, MessageWriter};

/// Messages on the distributed-search network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributedMessage {
    /// A search relayed down the distributed tree. The leading integer's
    /// purpose is not known; it is carried through verbatim.
    SearchRequest {
        unknown: u32,
        username: String,
        token: u32,
        query: String,
    },
    /// A code outside the typed catalog; the frame body is preserved.
    Unknown { code: u32, body: Bytes },
}

impl DistributedMessage {
    /// Encodes the full frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        match self {
            DistributedMessage::SearchRequest {
                unknown,
                username,
                token,
                query,
            } => {
                let mut writer = MessageWriter::new(DistributedCode::SearchRequest.into());
                writer
                    .write_u32(*unknown)
                    .write_string(username)
                    .write_u32(*token)
                    .write_string(query);
                writer.build()
            }
            DistributedMessage::Unknown { body, .. } => {
                let mut frame = BytesMut::with_capacity(4 + body.len());
                frame.put_u32_le(body.len() as u32);
                frame.put_slice(body);
                frame.freeze()
            }
        }
    }

    /// Decodes a frame body (the bytes after the length prefix).
    pub fn decode(body: Bytes) -> Result<Self, CodecError> {
        let mut reader = MessageReader::new(body.clone());
        let raw_code = reader.read_code()?;
        match DistributedCode::try_from(raw_code) {
            Ok(DistributedCode::SearchRequest) => Ok(DistributedMessage::SearchRequest {
                unknown: reader.read_u32()?,
                username: reader.read_string()?,
                token: reader.read_u32()?,
                query: reader.read_string()?,
            }),
            Err(_) => Ok(DistributedMessage::Unknown { code: raw_code, body }),
        }
    }
}
