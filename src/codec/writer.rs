use std::io::Write as _;
use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::write::DeflateEncoder;
use flate2::Compression;

use super::error::CodecError;
use super::shares::{SharedDirectory, SharedFile};

/// Builds one wire frame: length prefix, message code, typed fields.
///
/// The length prefix is reserved up front and patched by [`build`], so
/// fields can be appended without knowing the final size. All multi-byte
/// values are little-endian.
///
/// # Examples
///
/// ```
/// use rslsk::codec::MessageWriter;
///
/// // Peer.BrowseRequest: code 4, empty payload
/// let frame = MessageWriter::new(4).build();
/// assert_eq!(&frame[..], &[4, 0, 0, 0, 4, 0, 0, 0]);
/// ```
///
/// [`build`]: MessageWriter::build
#[derive(Debug)]
pub struct MessageWriter {
    buf: BytesMut,
    payload_start: usize,
}

impl MessageWriter {
    /// Starts a frame in one of the 4-byte code spaces (server, peer,
    /// distributed).
    pub fn new(code: u32) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(0); // length, patched in build()
        buf.put_u32_le(code);
        Self {
            buf,
            payload_start: 8,
        }
    }

    /// Starts a frame in the single-byte connection-init code space
    /// (`PierceFirewall` = 0, `PeerInit` = 1).
    pub fn init(code: u8) -> Self {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32_le(0);
        buf.put_u8(code);
        Self {
            buf,
            payload_start: 5,
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(value as u8);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    /// Writes a string as 4-byte byte-length plus UTF-8 bytes, no
    /// terminator.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    /// Appends raw bytes with no length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    /// Writes an IPv4 address in the protocol's reversed-octet order.
    pub fn write_ip(&mut self, addr: Ipv4Addr) -> &mut Self {
        self.buf.put_u32_le(u32::from(addr));
        self
    }

    /// Writes a file entry. A single placeholder byte precedes each file
    /// entry on the wire.
    pub fn write_file(&mut self, file: &SharedFile) -> &mut Self {
        self.write_u8(1);
        self.write_string(&file.filename);
        self.write_u64(file.size);
        self.write_string(&file.extension);
        self.write_u32(file.attributes.len() as u32);
        for attribute in &file.attributes {
            self.write_u32(attribute.kind.code());
            self.write_u32(attribute.value);
        }
        self
    }

    /// Writes a directory entry: name, file count, files.
    pub fn write_directory(&mut self, directory: &SharedDirectory) -> &mut Self {
        self.write_string(&directory.name);
        self.write_u32(directory.files.len() as u32);
        for file in &directory.files {
            self.write_file(file);
        }
        self
    }

    /// Replaces everything written after the code with its raw deflate
    /// compression. Used by messages whose payload is compressed on the
    /// wire, notably the browse response.
    pub fn compress(&mut self) -> Result<&mut Self, CodecError> {
        let payload = self.buf.split_off(self.payload_start);
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&payload)
            .and_then(|_| encoder.finish())
            .map(|compressed| self.buf.put_slice(&compressed))
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(self)
    }

    /// Patches the length prefix and returns the finished frame, ready to
    /// write to a socket.
    pub fn build(mut self) -> Bytes {
        let body_len = (self.buf.len() - 4) as u32;
        self.buf[0..4].copy_from_slice(&body_len.to_le_bytes());
        self.buf.freeze()
    }
}
