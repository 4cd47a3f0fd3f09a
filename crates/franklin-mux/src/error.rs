//! Error types for the coordinator

use franklin_protocol::{DeviceId, DeviceMethod};
use thiserror::Error;

use crate::connection::Role;

/// Errors reported to sessions and to the server
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MuxError {
    /// The session has no bound printer
    #[error("No active printer")]
    NoActivePrinter,

    /// No running printer has this uuid
    #[error("printer not found: {0}")]
    PrinterNotFound(DeviceId),

    /// The printer died while the call was outstanding
    #[error("{0}")]
    PrinterDied(String),

    /// The worker answered with an error record
    #[error("call failed: {0}")]
    CallFailed(serde_json::Value),

    /// The printer has no port to disable
    #[error("printer {0} is not enabled")]
    NotEnabled(DeviceId),

    /// The session role may not perform this operation
    #[error("permission denied: {operation} needs more than {role} access")]
    PermissionDenied {
        /// Requested operation
        operation: &'static str,
        /// Role of the session
        role: Role,
    },

    /// The method is reserved for the server itself
    #[error("method {0} cannot be called from a session")]
    MethodNotAllowed(DeviceMethod),

    /// The port is not in the registry
    #[error("unknown port: {0}")]
    UnknownPort(String),

    /// No flash recipe exists for the board
    #[error("board type not supported: {0}")]
    UnsupportedBoard(String),

    /// Starting a worker process failed
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// A reply could not be converted to the expected type
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    /// The coordinator task is gone
    #[error("coordinator is not running")]
    CoordinatorGone,
}
