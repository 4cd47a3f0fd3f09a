//! Worker method names
//!
//! Sessions may only invoke the methods listed here; the host never turns
//! an arbitrary string into a worker call.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Methods understood by worker processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMethod {
    // Lifecycle, issued by the host itself
    GetGlobals,
    SendPrinter,
    Connect,
    Reconnect,
    Disconnect,
    ResetUuid,
    Die,

    // Settings and profiles
    SetGlobals,
    ExportSettings,
    ImportSettings,
    ListProfiles,
    Load,
    Save,
    RemoveProfile,
    SetDefaultProfile,

    // Hardware state
    GetAxis,
    SetAxis,
    GetMotor,
    SetMotor,
    GetSpace,
    SetSpace,
    GetTemp,
    SetTemp,
    ReadTemp,
    GetGpio,
    SetGpio,
    GetPosition,

    // Motion and jobs
    Home,
    Park,
    Goto,
    Sleep,
    Pause,
    Abort,
    WaitForTemp,
    QueueAdd,
    QueueAddFile,
    QueueRemove,
    QueuePrint,
    GetQueue,
    AudioAddFile,
    ImportFile,
    RunFile,
}

impl DeviceMethod {
    /// Every method, in declaration order
    pub const ALL: [DeviceMethod; 42] = [
        DeviceMethod::GetGlobals,
        DeviceMethod::SendPrinter,
        DeviceMethod::Connect,
        DeviceMethod::Reconnect,
        DeviceMethod::Disconnect,
        DeviceMethod::ResetUuid,
        DeviceMethod::Die,
        DeviceMethod::SetGlobals,
        DeviceMethod::ExportSettings,
        DeviceMethod::ImportSettings,
        DeviceMethod::ListProfiles,
        DeviceMethod::Load,
        DeviceMethod::Save,
        DeviceMethod::RemoveProfile,
        DeviceMethod::SetDefaultProfile,
        DeviceMethod::GetAxis,
        DeviceMethod::SetAxis,
        DeviceMethod::GetMotor,
        DeviceMethod::SetMotor,
        DeviceMethod::GetSpace,
        DeviceMethod::SetSpace,
        DeviceMethod::GetTemp,
        DeviceMethod::SetTemp,
        DeviceMethod::ReadTemp,
        DeviceMethod::GetGpio,
        DeviceMethod::SetGpio,
        DeviceMethod::GetPosition,
        DeviceMethod::Home,
        DeviceMethod::Park,
        DeviceMethod::Goto,
        DeviceMethod::Sleep,
        DeviceMethod::Pause,
        DeviceMethod::Abort,
        DeviceMethod::WaitForTemp,
        DeviceMethod::QueueAdd,
        DeviceMethod::QueueAddFile,
        DeviceMethod::QueueRemove,
        DeviceMethod::QueuePrint,
        DeviceMethod::GetQueue,
        DeviceMethod::AudioAddFile,
        DeviceMethod::ImportFile,
        DeviceMethod::RunFile,
    ];

    /// Wire name of the method
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetGlobals => "get_globals",
            Self::SendPrinter => "send_printer",
            Self::Connect => "connect",
            Self::Reconnect => "reconnect",
            Self::Disconnect => "disconnect",
            Self::ResetUuid => "reset_uuid",
            Self::Die => "die",
            Self::SetGlobals => "set_globals",
            Self::ExportSettings => "export_settings",
            Self::ImportSettings => "import_settings",
            Self::ListProfiles => "list_profiles",
            Self::Load => "load",
            Self::Save => "save",
            Self::RemoveProfile => "remove_profile",
            Self::SetDefaultProfile => "set_default_profile",
            Self::GetAxis => "get_axis",
            Self::SetAxis => "set_axis",
            Self::GetMotor => "get_motor",
            Self::SetMotor => "set_motor",
            Self::GetSpace => "get_space",
            Self::SetSpace => "set_space",
            Self::GetTemp => "get_temp",
            Self::SetTemp => "set_temp",
            Self::ReadTemp => "read_temp",
            Self::GetGpio => "get_gpio",
            Self::SetGpio => "set_gpio",
            Self::GetPosition => "get_position",
            Self::Home => "home",
            Self::Park => "park",
            Self::Goto => "goto",
            Self::Sleep => "sleep",
            Self::Pause => "pause",
            Self::Abort => "abort",
            Self::WaitForTemp => "wait_for_temp",
            Self::QueueAdd => "queue_add",
            Self::QueueAddFile => "queue_add_file",
            Self::QueueRemove => "queue_remove",
            Self::QueuePrint => "queue_print",
            Self::GetQueue => "get_queue",
            Self::AudioAddFile => "audio_add_file",
            Self::ImportFile => "import_file",
            Self::RunFile => "run_file",
        }
    }

    /// Whether a session may forward this method to its bound device.
    ///
    /// Port ownership and identity changes stay with the host.
    pub fn is_forwardable(self) -> bool {
        !matches!(
            self,
            Self::Connect | Self::Reconnect | Self::Disconnect | Self::ResetUuid | Self::Die
        )
    }
}

impl fmt::Display for DeviceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown method: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        for method in DeviceMethod::ALL {
            assert_eq!(method.as_str().parse::<DeviceMethod>(), Ok(method));
        }
        assert!("__getattr__".parse::<DeviceMethod>().is_err());
    }

    #[test]
    fn test_lifecycle_methods_not_forwardable() {
        assert!(!DeviceMethod::Die.is_forwardable());
        assert!(!DeviceMethod::Connect.is_forwardable());
        assert!(DeviceMethod::Home.is_forwardable());
        assert!(DeviceMethod::SendPrinter.is_forwardable());
    }
}
