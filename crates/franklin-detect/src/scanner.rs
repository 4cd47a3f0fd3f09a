//! Serial port scanner
//!
//! This module lists candidate serial ports. On Linux the sysfs tty class
//! is authoritative (it includes ports `serialport` does not report, such
//! as on-board UARTs); elsewhere the `serialport` enumeration is used.

use std::path::{Path, PathBuf};

use serialport::available_ports;
use tracing::{debug, trace, warn};

use crate::error::DetectError;

/// Default sysfs directory listing tty devices
const SYSFS_TTY: &str = "/sys/class/tty";

/// Serial port scanner
#[derive(Debug, Clone)]
pub struct PortScanner {
    sysfs_root: Option<PathBuf>,
}

impl PortScanner {
    /// Create a new scanner using sysfs when available
    pub fn new() -> Self {
        Self {
            sysfs_root: Some(PathBuf::from(SYSFS_TTY)),
        }
    }

    /// Create a scanner reading tty names from a custom directory
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: Some(root.into()),
        }
    }

    /// Create a scanner that only uses the `serialport` enumeration
    pub fn without_sysfs() -> Self {
        Self { sysfs_root: None }
    }

    /// Enumerate all candidate serial port paths, sorted
    pub fn enumerate_ports(&self) -> Result<Vec<String>, DetectError> {
        let mut ports = match self.sysfs_root.as_deref().map(list_sysfs) {
            Some(Ok(ports)) => ports,
            Some(Err(e)) => {
                warn!("Cannot read tty class ({}), falling back to serialport", e);
                self.enumerate_serialport()?
            }
            None => self.enumerate_serialport()?,
        };
        ports.sort();
        ports.dedup();

        debug!("Found {} serial port(s)", ports.len());
        for port in &ports {
            trace!("  {}", port);
        }
        Ok(ports)
    }

    fn enumerate_serialport(&self) -> Result<Vec<String>, DetectError> {
        let ports =
            available_ports().map_err(|e| DetectError::EnumerationFailed(e.to_string()))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn list_sysfs(root: &Path) -> std::io::Result<Vec<String>> {
    let mut ports = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let name = entry?.file_name();
        ports.push(format!("/dev/{}", name.to_string_lossy()));
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysfs_listing() {
        let dir = std::env::temp_dir().join(format!("franklin-scan-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("ttyUSB0")).unwrap();
        std::fs::create_dir_all(dir.join("ttyACM1")).unwrap();

        let ports = PortScanner::with_sysfs_root(&dir).enumerate_ports().unwrap();
        assert_eq!(ports, vec!["/dev/ttyACM1".to_string(), "/dev/ttyUSB0".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
