//! Persisted devices
//!
//! A device is persisted when `<data_dir>/<uuid>/profiles` is a directory.
//! Nothing else about the on-disk layout is interpreted here.

use std::path::Path;

use franklin_protocol::DeviceId;
use tracing::{debug, warn};

/// Whether `uuid` has a profile directory under `data_dir`
pub fn is_persisted(data_dir: &Path, uuid: DeviceId) -> bool {
    data_dir.join(uuid.to_string()).join("profiles").is_dir()
}

/// All persisted devices under `data_dir`, sorted
pub fn persisted_devices(data_dir: &Path) -> Vec<DeviceId> {
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read data directory {}: {}", data_dir.display(), e);
            return Vec::new();
        }
    };

    let mut devices: Vec<DeviceId> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let uuid = DeviceId::parse(&name.to_string_lossy());
            if uuid.is_none() {
                debug!("Ignoring {:?} in data directory", name);
            }
            uuid
        })
        .filter(|uuid| is_persisted(data_dir, *uuid))
        .collect();
    devices.sort();
    devices
}
