use std::fmt;

/// A file attribute kind as carried in share listings and search replies.
///
/// The wire value is an integer; kinds the network uses today are named,
/// anything else round-trips through [`FileAttributeKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAttributeKind {
    /// Audio bitrate in kbit/s.
    Bitrate,
    /// Duration in seconds.
    Duration,
    /// 1 if the file is variable-bitrate encoded.
    VariableBitrate,
    /// Sample rate in Hz.
    SampleRate,
    /// Bit depth for lossless formats.
    BitDepth,
    /// An attribute kind this client does not know about.
    Unknown(u32),
}

impl FileAttributeKind {
    /// The integer value written to the wire.
    pub fn code(self) -> u32 {
        match self {
            FileAttributeKind::Bitrate => 0,
            FileAttributeKind::Duration => 1,
            FileAttributeKind::VariableBitrate => 2,
            FileAttributeKind::SampleRate => 4,
            FileAttributeKind::BitDepth => 5,
            FileAttributeKind::Unknown(code) => code,
        }
    }
}

impl From<u32> for FileAttributeKind {
    fn from(code: u32) -> Self {
        match code {
            0 => FileAttributeKind::Bitrate,
            1 => FileAttributeKind::Duration,
            2 => FileAttributeKind::VariableBitrate,
            4 => FileAttributeKind::SampleRate,
            5 => FileAttributeKind::BitDepth,
            other => FileAttributeKind::Unknown(other),
        }
    }
}

impl fmt::Display for FileAttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileAttributeKind::Bitrate => write!(f, "bitrate"),
            FileAttributeKind::Duration => write!(f, "duration"),
            FileAttributeKind::VariableBitrate => write!(f, "vbr"),
            FileAttributeKind::SampleRate => write!(f, "sample rate"),
            FileAttributeKind::BitDepth => write!(f, "bit depth"),
            FileAttributeKind::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

/// One attribute pair on a shared file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttribute {
    pub kind: FileAttributeKind,
    pub value: u32,
}

impl FileAttribute {
    pub fn new(kind: FileAttributeKind, value: u32) -> Self {
        Self { kind, value }
    }
}

/// A file entry inside a shared directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    /// Filename, without directory.
    pub filename: String,
    /// File size in bytes.
    pub size: u64,
    /// Extension, as the sharing peer reports it.
    pub extension: String,
    /// Attribute pairs (bitrate, duration, ...).
    pub attributes: Vec<FileAttribute>,
}

/// A directory entry in a browse listing.
///
/// Directory names arrive with either `\` or `/` separators depending on
/// the sending client; the bytes are preserved verbatim. Whether the
/// directory is locked is conveyed by which list it appeared in, not by a
/// field on the entry itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDirectory {
    /// Full directory path as sent by the peer.
    pub name: String,
    /// Files in this directory.
    pub files: Vec<SharedFile>,
}

impl SharedDirectory {
    pub fn new(name: impl Into<String>, files: Vec<SharedFile>) -> Self {
        Self {
            name: name.into(),
            files,
        }
    }
}
