//! Error types for device detection

use thiserror::Error;

/// Errors that can occur during detection
#[derive(Debug, Error)]
pub enum DetectError {
    /// Failed to enumerate serial ports
    #[error("failed to enumerate ports: {0}")]
    EnumerationFailed(String),

    /// Failed to open serial port
    #[error("failed to open port {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    /// No identify frame arrived within the retry budget
    #[error("timeout waiting for device on {port} after {retries} retries")]
    Timeout { port: String, retries: u32 },

    /// I/O error during the handshake
    #[error("I/O error on {port}: {reason}")]
    IoError { port: String, reason: String },

    /// The link closed while waiting for an identify frame
    #[error("link to {0} closed during detection")]
    Closed(String),

    /// Invalid blacklist pattern
    #[error("invalid blacklist pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
