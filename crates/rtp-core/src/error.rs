//! Error types for rtp-core operations

use thiserror::Error;

/// Errors produced while parsing, reframing, or generating RTP
#[derive(Debug, Error)]
pub enum Error {
    /// Buffer too small to hold an RTP header
    #[error("packet too short: {size} bytes")]
    PacketTooShort { size: usize },

    /// RTP version field was not 2
    #[error("unsupported RTP version: {version}")]
    UnsupportedVersion { version: u8 },

    /// Header claims more CSRC/extension data than the buffer holds
    #[error("truncated RTP header: need {needed} bytes, have {available}")]
    TruncatedHeader { needed: usize, available: usize },

    /// Prompt file could not be opened or read
    #[error("prompt unavailable: {path}: {source}")]
    PromptUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Payload type has no known frame geometry
    #[error("no frame geometry for payload type {payload_type}")]
    UnknownPayloadType { payload_type: u8 },

    /// I/O errors from the capture sink
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
