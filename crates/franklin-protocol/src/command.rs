//! Single-byte commands exchanged with device firmware
//!
//! The host and the firmware share a small set of one-byte commands that
//! travel outside of the normal packet framing. Only `Id` and `Startup` can
//! lead an identify frame; the others are acknowledgements.

/// Single-byte command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SingleCommand {
    /// Packet accepted
    Ok = 0xb3,
    /// Firmware is busy, retry later
    Wait = 0xad,
    /// Identify request (host → device) and identify reply lead byte
    Id = 0x9a,
    /// Sent by freshly booted firmware in place of `Id`
    Startup = 0x8f,
}

impl SingleCommand {
    /// All known single-byte commands
    pub const ALL: [SingleCommand; 4] = [
        SingleCommand::Ok,
        SingleCommand::Wait,
        SingleCommand::Id,
        SingleCommand::Startup,
    ];

    /// Commands that may lead an identify frame
    pub const FRAME_LEADS: [SingleCommand; 2] = [SingleCommand::Id, SingleCommand::Startup];

    /// Raw byte value of this command
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Look up a command by its byte value
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_byte() == byte)
    }

    /// Whether `byte` is a valid first byte of an identify frame
    pub fn is_frame_lead(byte: u8) -> bool {
        Self::FRAME_LEADS.iter().any(|c| c.as_byte() == byte)
    }

    /// Encoded form ready to write to the serial link
    pub fn encode(self) -> [u8; 1] {
        [self.as_byte()]
    }
}
