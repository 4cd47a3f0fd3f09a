//! Device identities and per-spawn run identifiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a device, stored in its firmware
///
/// The firmware keeps 16 raw bytes. They count as a valid identity only
/// when byte 7 carries version nibble `4` and byte 9 carries variant bits
/// `10`; anything else is treated as a blank or corrupted identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Accept raw identity bytes if they carry the version/variant markers
    pub fn from_identity_bytes(bytes: [u8; 16]) -> Option<Self> {
        if bytes[7] & 0xf0 != 0x40 || bytes[9] & 0xc0 != 0x80 {
            return None;
        }
        Some(Self(Uuid::from_bytes(bytes)))
    }

    /// Mint a fresh identity with valid markers
    pub fn generate() -> Self {
        let mut bytes = Uuid::new_v4().into_bytes();
        bytes[7] = (bytes[7] & 0x0f) | 0x40;
        bytes[9] = (bytes[9] & 0x3f) | 0x80;
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse the hyphenated textual form
    pub fn parse(s: &str) -> Option<Self> {
        let uuid = Uuid::parse_str(s).ok()?;
        Self::from_identity_bytes(uuid.into_bytes())
    }

    /// Raw identity bytes as stored in firmware
    pub fn into_bytes(self) -> [u8; 16] {
        self.0.into_bytes()
    }

    /// Underlying UUID value
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid device id: {s}"))
    }
}

/// Identifier handed to a device when its worker is started
///
/// A device echoes its run-id in every identify frame, which lets the host
/// recognize a worker that moved to another port before it reported its
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId([u8; 8]);

impl RunId {
    /// Wrap raw run-id bytes
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Each byte as a one-character string, the form workers expect in
    /// `connect` calls
    pub fn to_chars(&self) -> Vec<String> {
        self.0.iter().map(|&b| char::from(b).to_string()).collect()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Nibble-to-byte table for run-ids. Every entry has a distinct parity
/// signature, so run-id bytes never look like single-byte commands.
const ID_MAP: [u8; 16] = [
    0x40, 0xe1, 0xd2, 0x73, 0x74, 0xd5, 0xe6, 0x47, 0xf8, 0x59, 0x6a, 0xcb, 0xcc, 0x6d, 0x5e, 0xff,
];

/// Odd step with a set bit in every nibble; visits all 2^32 values before
/// repeating.
const RUN_ID_STEP: u32 = 0x2345_6789;

/// Generator for run-ids
#[derive(Debug, Clone)]
pub struct RunIdGenerator {
    last: u32,
}

impl RunIdGenerator {
    /// Create a generator starting at a random point
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Create a generator with a fixed starting point
    pub fn with_seed(seed: u32) -> Self {
        Self { last: seed }
    }

    /// Produce the next run-id
    pub fn next_id(&mut self) -> RunId {
        self.last = self.last.wrapping_add(RUN_ID_STEP);
        let mut bytes = [0u8; 8];
        for (c, byte) in bytes.iter_mut().enumerate() {
            *byte = ID_MAP[((self.last >> (4 * c)) & 0xf) as usize];
        }
        RunId(bytes)
    }
}

impl Default for RunIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SingleCommand;

    #[test]
    fn test_generated_id_is_valid() {
        for _ in 0..32 {
            let id = DeviceId::generate();
            assert_eq!(DeviceId::from_identity_bytes(id.into_bytes()), Some(id));
        }
    }

    #[test]
    fn test_rejects_missing_markers() {
        let mut bytes = DeviceId::generate().into_bytes();
        bytes[7] &= 0x0f;
        assert_eq!(DeviceId::from_identity_bytes(bytes), None);

        let mut bytes = DeviceId::generate().into_bytes();
        bytes[9] |= 0xc0;
        assert_eq!(DeviceId::from_identity_bytes(bytes), None);

        assert_eq!(DeviceId::from_identity_bytes([0xff; 16]), None);
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let id = DeviceId::generate();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.parse::<DeviceId>(), Ok(id));
    }

    #[test]
    fn test_run_ids_differ_and_avoid_commands() {
        let mut gen = RunIdGenerator::with_seed(0);
        let a = gen.next_id();
        let b = gen.next_id();
        assert_ne!(a, b);
        for byte in a.as_bytes().iter().chain(b.as_bytes()) {
            assert!(ID_MAP.contains(byte));
            assert!(SingleCommand::from_byte(*byte).is_none());
        }
    }

    #[test]
    fn test_run_id_nibble_mapping() {
        let mut gen = RunIdGenerator::with_seed(0u32.wrapping_sub(RUN_ID_STEP));
        // last becomes 0 -> every nibble maps to ID_MAP[0]
        assert_eq!(gen.next_id(), RunId::new([0x40; 8]));
    }

    #[test]
    fn test_run_id_chars() {
        let run_id = RunId::new([0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47]);
        assert_eq!(run_id.to_chars()[0], "@");
        assert_eq!(run_id.to_string(), "4041424344454647");
    }
}
