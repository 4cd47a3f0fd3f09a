//! Error types for frame and record decoding

use thiserror::Error;

/// Errors that can occur while decoding protocol data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer is incomplete - need more data
    #[error("incomplete data: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Lead byte is not a recognized single-byte command
    #[error("unknown command byte: 0x{0:02X}")]
    UnknownCommand(u8),

    /// Checksum mismatch
    #[error("checksum mismatch in group {group}: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { group: usize, expected: u8, actual: u8 },

    /// Worker record is not valid JSON
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Worker record carries a tag the host does not understand
    #[error("unknown record tag: {0}")]
    UnknownTag(String),

    /// Worker record is missing a field its tag requires
    #[error("record {tag} is missing {field}")]
    MissingField {
        tag: &'static str,
        field: &'static str,
    },
}
