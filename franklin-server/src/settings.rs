//! Server settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use franklin_detect::{PortFilter, DEFAULT_BLACKLIST};
use franklin_mux::{BoardSpec, CoordinatorConfig, FlashTemplates, SystemBackend};
use franklin_protocol::DeviceId;
use serde::{Deserialize, Serialize};

/// Server settings, stored as JSON
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Printer new sessions start bound to
    pub default_printer: Option<DeviceId>,
    /// Ports never probed (glob patterns)
    pub blacklist: Vec<String>,
    /// Patterns added to `blacklist`
    pub add_blacklist: Vec<String>,
    /// Detect on new ports and after disconnects
    pub autodetect: bool,
    /// Shell command run before detection; `#PORT#` is replaced
    pub predetect: String,
    /// Policy for system commands run by jobs
    pub allow_system: String,
    /// Non-empty to serve a local device through the synthetic port `-`
    pub local: String,
    /// Worker program
    pub driver: String,
    /// Firmware driver handed to every worker
    pub cdriver: String,
    /// Command the worker runs when a job completes
    pub done: String,
    /// Where persisted devices live
    pub data_dir: Option<PathBuf>,
    /// Firmware upload command. Placeholders: `#PORT#`, `#MCU#`, `#BAUD#`,
    /// `#PROTOCOL#`, `#FIRMWARE#`
    pub flash_command: String,
    /// Directory holding `<mcu>.hex` images
    pub firmware_dir: PathBuf,
    /// Boards offered for upload
    pub boards: Vec<BoardSpec>,
    /// Hot-plug polling period, 0 to disable
    pub scan_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let flash = FlashTemplates::default();
        Self {
            default_printer: None,
            blacklist: DEFAULT_BLACKLIST.iter().map(|p| p.to_string()).collect(),
            add_blacklist: Vec::new(),
            autodetect: true,
            predetect: "stty -F #PORT# raw 115200 -echo -echoe -echok -echoke -echonl -echoprt"
                .to_string(),
            allow_system: String::new(),
            local: String::new(),
            driver: "franklin-driver".to_string(),
            cdriver: String::new(),
            done: String::new(),
            data_dir: dirs::data_dir().map(|d| d.join("franklin")),
            flash_command: flash.command,
            firmware_dir: flash.firmware_dir,
            boards: Vec::new(),
            scan_interval_ms: 2000,
        }
    }
}

impl Settings {
    /// Get the XDG config directory for franklin
    /// Uses $XDG_CONFIG_HOME/franklin, falls back to ~/.config/franklin
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("franklin"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("franklin"))
    }

    /// Default settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from the default location; a missing or unreadable
    /// file gives the defaults
    pub fn load() -> Self {
        Self::settings_path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Load settings from an explicit file, which must exist and parse
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }

    /// Save settings to `path`
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json).context("Failed to write settings")
    }

    /// Hot-plug polling period, `None` when disabled
    pub fn scan_interval(&self) -> Option<Duration> {
        (self.scan_interval_ms > 0).then(|| Duration::from_millis(self.scan_interval_ms))
    }

    /// Coordinator settings
    pub fn coordinator_config(&self) -> anyhow::Result<CoordinatorConfig> {
        let patterns: Vec<&str> = self
            .blacklist
            .iter()
            .chain(&self.add_blacklist)
            .map(String::as_str)
            .collect();
        let blacklist = PortFilter::new(&patterns).context("Invalid blacklist")?;
        Ok(CoordinatorConfig {
            autodetect: self.autodetect,
            blacklist,
            allow_system: self.allow_system.clone(),
            default_printer: self.default_printer,
            boards: self.boards.clone(),
            data_dir: self.data_dir.clone(),
            ..CoordinatorConfig::default()
        })
    }

    /// Backend talking to real ports and worker processes
    pub fn backend(&self) -> SystemBackend {
        let mut driver_args = Vec::new();
        if !self.cdriver.is_empty() {
            driver_args.extend(["--cdriver".to_string(), self.cdriver.clone()]);
        }
        if !self.done.is_empty() {
            driver_args.extend(["--done".to_string(), self.done.clone()]);
        }
        SystemBackend {
            predetect: Some(self.predetect.clone()).filter(|p| !p.is_empty()),
            driver: self.driver.clone(),
            driver_args,
            flash: FlashTemplates {
                command: self.flash_command.clone(),
                firmware_dir: self.firmware_dir.clone(),
                ..FlashTemplates::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"autodetect": false, "add_blacklist": ["/dev/ttyUSB9"]}"#)
                .unwrap();
        assert!(!settings.autodetect);
        assert_eq!(settings.driver, "franklin-driver");

        let config = settings.coordinator_config().unwrap();
        assert!(config.blacklist.is_blacklisted("/dev/ttyUSB9"));
        assert!(config.blacklist.is_blacklisted("/dev/tty1"));
        assert!(!config.blacklist.is_blacklisted("/dev/ttyUSB0"));
    }

    #[test]
    fn test_invalid_blacklist() {
        let settings = Settings {
            add_blacklist: vec!["/dev/[".into()],
            ..Settings::default()
        };
        assert!(settings.coordinator_config().is_err());
    }

    #[test]
    fn test_backend_arguments() {
        let settings = Settings {
            cdriver: "/usr/lib/franklin/cdriver".into(),
            done: "beep".into(),
            predetect: String::new(),
            ..Settings::default()
        };
        let backend = settings.backend();
        assert_eq!(backend.predetect, None);
        assert_eq!(
            backend.driver_args,
            vec!["--cdriver", "/usr/lib/franklin/cdriver", "--done", "beep"]
        );
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("franklin-settings-{}", std::process::id()))
            .join("settings.json");
        let settings = Settings {
            default_printer: Some(DeviceId::generate()),
            scan_interval_ms: 0,
            ..Settings::default()
        };
        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.scan_interval(), None);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
