//! Coordinator configuration

use std::path::PathBuf;

use franklin_detect::{HandshakeConfig, PortFilter};
use franklin_protocol::DeviceId;

use crate::firmware::BoardSpec;

/// Settings the coordinator runs with
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Detect on newly added ports and after disconnects
    pub autodetect: bool,
    /// Ports never added to the registry
    pub blacklist: PortFilter,
    /// Policy string handed to every worker
    pub allow_system: String,
    /// Printer new sessions start bound to
    pub default_printer: Option<DeviceId>,
    /// Boards offered for firmware upload
    pub boards: Vec<BoardSpec>,
    /// Identify handshake timing
    pub handshake: HandshakeConfig,
    /// Root of persisted device directories
    pub data_dir: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            autodetect: true,
            blacklist: PortFilter::empty(),
            allow_system: String::new(),
            default_printer: None,
            boards: Vec::new(),
            handshake: HandshakeConfig::default(),
            data_dir: None,
        }
    }
}
