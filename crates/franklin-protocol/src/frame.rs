//! Identify frame codec
//!
//! A device answers the `ID` command with a 34-byte frame:
//!
//! ```text
//! [command:1][run-id:8][identity:16][checksum:9]
//! ```
//!
//! Serial links deliver arbitrary fragments and may carry leftover bytes
//! from earlier traffic, so [`FrameAssembler`] buffers input and
//! resynchronizes on the next plausible lead byte whenever a candidate
//! frame fails validation.

use tracing::{debug, trace};

use crate::checksum;
use crate::command::SingleCommand;
use crate::error::ParseError;
use crate::identity::{DeviceId, RunId};

/// Bytes covered by the checksum: command + run-id + identity
pub const PAYLOAD_LEN: usize = 1 + 8 + 16;

/// Total frame length including check bytes
pub const FRAME_LEN: usize = 34;

/// A decoded identify frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyFrame {
    /// Lead command (`Id` or `Startup`)
    pub command: SingleCommand,
    /// Run-id the device was last handed by a worker
    pub run_id: RunId,
    /// Raw identity bytes as stored in firmware
    pub identity: [u8; 16],
}

impl IdentifyFrame {
    /// Create a new frame
    pub fn new(command: SingleCommand, run_id: RunId, identity: [u8; 16]) -> Self {
        Self {
            command,
            run_id,
            identity,
        }
    }

    /// Validated device identity, or `None` for a broken identity
    pub fn device_id(&self) -> Option<DeviceId> {
        DeviceId::from_identity_bytes(self.identity)
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = self.command.as_byte();
        frame[1..9].copy_from_slice(self.run_id.as_bytes());
        frame[9..PAYLOAD_LEN].copy_from_slice(&self.identity);
        let check = checksum::checksum(&frame[..PAYLOAD_LEN]);
        frame[PAYLOAD_LEN..].copy_from_slice(&check);
        frame
    }

    /// Decode and validate exactly one frame
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < FRAME_LEN {
            return Err(ParseError::Incomplete {
                needed: FRAME_LEN - data.len(),
            });
        }

        let command = SingleCommand::from_byte(data[0])
            .filter(|c| SingleCommand::FRAME_LEADS.contains(c))
            .ok_or(ParseError::UnknownCommand(data[0]))?;

        checksum::verify(&data[..FRAME_LEN], PAYLOAD_LEN)?;

        let mut run_id = [0u8; 8];
        run_id.copy_from_slice(&data[1..9]);
        let mut identity = [0u8; 16];
        identity.copy_from_slice(&data[9..PAYLOAD_LEN]);

        Ok(Self {
            command,
            run_id: RunId::new(run_id),
            identity,
        })
    }
}

/// Streaming assembler for identify frames
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_LEN * 2),
        }
    }

    /// Append raw bytes from the link
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes still needed before the next frame can be attempted
    pub fn missing(&self) -> usize {
        FRAME_LEN.saturating_sub(self.buffer.len())
    }

    /// Number of buffered bytes
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the next valid frame, dropping garbage along the way
    pub fn next_frame(&mut self) -> Option<IdentifyFrame> {
        while self.buffer.len() >= FRAME_LEN {
            match IdentifyFrame::decode(&self.buffer[..FRAME_LEN]) {
                Ok(frame) => {
                    self.buffer.drain(..FRAME_LEN);
                    return Some(frame);
                }
                Err(e) => {
                    let skip = self.resync_offset();
                    debug!(
                        "skip non-id ({}): dropping {} of {:02x?}",
                        e,
                        skip,
                        &self.buffer[..FRAME_LEN]
                    );
                    self.buffer.drain(..skip);
                }
            }
        }
        trace!("incomplete id: {} bytes buffered", self.buffer.len());
        None
    }

    /// Position of the next possible lead byte, never less than 1
    fn resync_offset(&self) -> usize {
        self.buffer
            .iter()
            .skip(1)
            .position(|&b| SingleCommand::is_frame_lead(b))
            .map_or(self.buffer.len(), |p| p + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_frame() -> IdentifyFrame {
        IdentifyFrame::new(
            SingleCommand::Id,
            RunId::new([0x40, 0xe1, 0xd2, 0x73, 0x74, 0xd5, 0xe6, 0x47]),
            DeviceId::generate().into_bytes(),
        )
    }

    #[test]
    fn test_roundtrip_preserves_identity() {
        let frame = sample_frame();
        let bytes = frame.encode();
        assert_eq!(bytes.len(), FRAME_LEN);

        let mut assembler = FrameAssembler::new();
        assembler.push_bytes(&bytes);
        let decoded = assembler.next_frame().unwrap();
        assert_eq!(decoded.identity, frame.identity);
        assert_eq!(decoded.run_id, frame.run_id);
        assert!(decoded.device_id().is_some());
    }

    #[test]
    fn test_fragmented_input() {
        let bytes = sample_frame().encode();
        let mut assembler = FrameAssembler::new();

        assembler.push_bytes(&bytes[..10]);
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.missing(), FRAME_LEN - 10);

        assembler.push_bytes(&bytes[10..]);
        assert!(assembler.next_frame().is_some());
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_resync_after_garbage() {
        let frame = sample_frame();
        let mut assembler = FrameAssembler::new();
        assembler.push_bytes(&[0x00, 0x11, SingleCommand::Ok.as_byte()]);
        assembler.push_bytes(&frame.encode());
        assert_eq!(assembler.next_frame(), Some(frame));
    }

    #[test]
    fn test_resync_on_false_lead() {
        // A lead byte followed by a truncated frame, then a real frame
        let frame = sample_frame();
        let mut assembler = FrameAssembler::new();
        assembler.push_bytes(&[SingleCommand::Id.as_byte(), 0x01, 0x02]);
        assembler.push_bytes(&frame.encode());
        assert_eq!(assembler.next_frame(), Some(frame));
    }

    #[test]
    fn test_broken_identity_still_decodes() {
        let frame = IdentifyFrame::new(SingleCommand::Startup, RunId::new([0x40; 8]), [0xff; 16]);
        let decoded = IdentifyFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.command, SingleCommand::Startup);
        assert_eq!(decoded.device_id(), None);
    }

    #[test]
    fn test_decode_rejects_non_lead() {
        let mut bytes = sample_frame().encode();
        bytes[0] = SingleCommand::Ok.as_byte();
        assert_eq!(
            IdentifyFrame::decode(&bytes),
            Err(ParseError::UnknownCommand(SingleCommand::Ok.as_byte()))
        );
    }

    proptest! {
        #[test]
        fn prop_garbage_prefix_without_leads_is_skipped(
            prefix in proptest::collection::vec(any::<u8>(), 0..80)
        ) {
            let prefix: Vec<u8> = prefix
                .into_iter()
                .filter(|b| !SingleCommand::is_frame_lead(*b))
                .collect();
            let frame = sample_frame();
            let mut assembler = FrameAssembler::new();
            assembler.push_bytes(&prefix);
            assembler.push_bytes(&frame.encode());
            prop_assert_eq!(assembler.next_frame(), Some(frame));
        }
    }
}
