use thiserror::Error;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The frame's message code was not the one the decoder expected.
    #[error("code mismatch: expected {expected}, actual {actual}")]
    CodeMismatch { expected: u32, actual: u32 },

    /// The frame body ended before a field could be read in full.
    #[error("truncated payload: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// The compressed payload block failed to inflate or deflate.
    #[error("compression error: {0}")]
    Compression(String),
}
