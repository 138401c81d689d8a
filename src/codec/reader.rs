use std::io::Read as _;
use std::net::Ipv4Addr;

use bytes::{Buf, Bytes};
use flate2::read::DeflateDecoder;

use super::error::CodecError;
use super::shares::{FileAttribute, FileAttributeKind, SharedDirectory, SharedFile};

/// Decodes one frame body: message code first, then typed fields.
///
/// The reader is handed the frame body (the bytes after the length
/// prefix). [`read_code`] or [`expect_code`] must be called before any
/// field read; [`decompress`] inflates the remainder of a compressed
/// payload in place. Strings with invalid UTF-8 are decoded lossily
/// rather than rejected, since peers send mixed encodings in practice.
///
/// [`read_code`]: MessageReader::read_code
/// [`expect_code`]: MessageReader::expect_code
/// [`decompress`]: MessageReader::decompress
#[derive(Debug)]
pub struct MessageReader {
    buf: Bytes,
}

impl MessageReader {
    pub fn new(body: Bytes) -> Self {
        Self { buf: body }
    }

    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Reads the 4-byte message code. Must be the first read on a frame in
    /// the server, peer, or distributed code spaces.
    pub fn read_code(&mut self) -> Result<u32, CodecError> {
        self.read_u32()
    }

    /// Reads the 4-byte message code and checks it against `expected`.
    pub fn expect_code(&mut self, expected: u32) -> Result<(), CodecError> {
        let actual = self.read_code()?;
        if actual != expected {
            return Err(CodecError::CodeMismatch { expected, actual });
        }
        Ok(())
    }

    /// Reads the single-byte code of a connection-init frame.
    pub fn read_init_code(&mut self) -> Result<u8, CodecError> {
        self.read_u8()
    }

    /// Replaces the remaining unread bytes with their inflation.
    /// Call after the code on messages with compressed payloads.
    pub fn decompress(&mut self) -> Result<&mut Self, CodecError> {
        let compressed = self.buf.split_to(self.buf.len());
        let mut decoder = DeflateDecoder::new(compressed.as_ref());
        let mut inflated = Vec::new();
        decoder
            .read_to_end(&mut inflated)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        self.buf = Bytes::from(inflated);
        Ok(self)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Reads a 4-byte length followed by that many bytes of UTF-8,
    /// decoded lossily.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        let raw = self.buf.split_to(len);
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Reads `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, CodecError> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Reads an IPv4 address from the protocol's reversed-octet order.
    pub fn read_ip(&mut self) -> Result<Ipv4Addr, CodecError> {
        Ok(Ipv4Addr::from(self.read_u32()?))
    }

    /// Reads a file entry, skipping the placeholder byte that precedes it.
    pub fn read_file(&mut self) -> Result<SharedFile, CodecError> {
        let _ = self.read_u8()?;
        let filename = self.read_string()?;
        let size = self.read_u64()?;
        let extension = self.read_string()?;
        let attribute_count = self.read_u32()? as usize;
        let mut attributes = Vec::with_capacity(attribute_count.min(64));
        for _ in 0..attribute_count {
            let kind = FileAttributeKind::from(self.read_u32()?);
            let value = self.read_u32()?;
            attributes.push(FileAttribute::new(kind, value));
        }
        Ok(SharedFile {
            filename,
            size,
            extension,
            attributes,
        })
    }

    /// Reads a directory entry: name, file count, files.
    pub fn read_directory(&mut self) -> Result<SharedDirectory, CodecError> {
        let name = self.read_string()?;
        let file_count = self.read_u32()? as usize;
        let mut files = Vec::with_capacity(file_count.min(1024));
        for _ in 0..file_count {
            files.push(self.read_file()?);
        }
        Ok(SharedDirectory { name, files })
    }

    /// True while unread bytes remain.
    pub fn has_more(&self) -> bool {
        self.buf.has_remaining()
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}
