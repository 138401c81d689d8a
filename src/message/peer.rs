use bytes::{BufMut, Bytes, BytesMut};

use super::code::PeerCode;
use crate::codec::{CodecError, MessageReader, MessageWriter, SharedDirectory};

/// A peer's share listing, sent compressed in answer to a browse request.
///
/// Locked directories are those the peer shares only with selected users;
/// their lock state is conveyed by the list they appear in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrowseResponse {
    pub directories: Vec<SharedDirectory>,
    pub locked_directories: Vec<SharedDirectory>,
}

impl BrowseResponse {
    /// Decodes a frame body, requiring the browse-response code.
    pub fn decode(body: Bytes) -> Result<Self, CodecError> {
        let mut reader = MessageReader::new(body);
        reader.expect_code(PeerCode::BrowseResponse.into())?;
        Self::read_payload(&mut reader)
    }

    fn read_payload(reader: &mut MessageReader) -> Result<Self, CodecError> {
        reader.decompress()?;
        let directory_count = reader.read_u32()? as usize;
        let mut directories = Vec::with_capacity(directory_count.min(4096));
        for _ in 0..directory_count {
            directories.push(reader.read_directory()?);
        }
        // Optional tail: one integer of unknown purpose, then the locked
        // directory list. Absent entirely from old clients.
        let mut locked_directories = Vec::new();
        if reader.has_more() {
            let _ = reader.read_u32()?;
            let locked_count = reader.read_u32()? as usize;
            locked_directories.reserve(locked_count.min(4096));
            for _ in 0..locked_count {
                locked_directories.push(reader.read_directory()?);
            }
        }
        Ok(Self {
            directories,
            locked_directories,
        })
    }
}

/// Messages exchanged over a peer message connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Request the peer's share listing.
    BrowseRequest,
    /// The share listing.
    BrowseResponse(BrowseResponse),
    /// Search this peer's shares, correlated by token.
    SearchRequest { token: u32, query: String },
    /// Request user info.
    InfoRequest,
    /// Ask where a file sits in the peer's upload queue.
    PlaceInQueueRequest { filename: String },
    /// A code outside the typed catalog; the frame body is preserved.
    Unknown { code: u32, body: Bytes },
}

impl PeerMessage {
    /// Encodes the full frame, length prefix included.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        match self {
            PeerMessage::BrowseRequest => {
                Ok(MessageWriter::new(PeerCode::BrowseRequest.into()).build())
            }
            PeerMessage::BrowseResponse(response) => {
                let mut writer = MessageWriter::new(PeerCode::BrowseResponse.into());
                writer.write_u32(response.directories.len() as u32);
                for directory in &response.directories {
                    writer.write_directory(directory);
                }
                // One integer of unknown purpose precedes the locked list;
                // every client writes zero.
                writer.write_u32(0);
                writer.write_u32(response.locked_directories.len() as u32);
                for directory in &response.locked_directories {
                    writer.write_directory(directory);
                }
                writer.compress()?;
                Ok(writer.build())
            }
            PeerMessage::SearchRequest { token, query } => {
                let mut writer = MessageWriter::new(PeerCode::SearchRequest.into());
                writer.write_u32(*token).write_string(query);
                Ok(writer.build())
            }
            PeerMessage::InfoRequest => {
                Ok(MessageWriter::new(PeerCode::InfoRequest.into()).build())
            }
            PeerMessage::PlaceInQueueRequest { filename } => {
                let mut writer = MessageWriter::new(PeerCode::PlaceInQueueRequest.into());
                writer.write_string(filename);
                Ok(writer.build())
            }
            PeerMessage::Unknown { body, .. } => {
                let mut frame = BytesMut::with_capacity(4 + body.len());
                frame.put_u32_le(body.len() as u32);
                frame.put_slice(body);
                Ok(frame.freeze())
            }
        }
    }

    /// Decodes a frame body (the bytes after the length prefix).
    pub fn decode(body: Bytes) -> Result<Self, CodecError> {
        let mut reader = MessageReader::new(body.clone());
        let raw_code = reader.read_code()?;
        let code = match PeerCode::try_from(raw_code) {
            Ok(code) => code,
            Err(_) => return Ok(PeerMessage::Unknown { code: raw_code, body }),
        };

        match code {
            PeerCode::BrowseRequest => Ok(PeerMessage::BrowseRequest),
            PeerCode::BrowseResponse => Ok(PeerMessage::BrowseResponse(
                BrowseResponse::read_payload(&mut reader)?,
            )),
            PeerCode::SearchRequest => Ok(PeerMessage::SearchRequest {
                token: reader.read_u32()?,
                query: reader.read_string()?,
            }),
            PeerCode::InfoRequest => Ok(PeerMessage::InfoRequest),
            PeerCode::PlaceInQueueRequest => Ok(PeerMessage::PlaceInQueueRequest {
                filename: reader.read_string()?,
            }),
        }
    }
}
