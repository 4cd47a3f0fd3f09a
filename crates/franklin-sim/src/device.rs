//! Virtual device firmware
//!
//! Emulates the serial side of a device during detection: every `Id`
//! command is answered with an identify frame carrying the stored identity
//! and the run-id the device was last handed.

use std::io;

use franklin_protocol::{DeviceId, IdentifyFrame, RunId, SingleCommand, FRAME_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A simulated device as seen through its serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDevice {
    identity: [u8; 16],
    run_id: RunId,
    /// `Id` requests ignored before the first answer, as while booting
    boot_requests: u32,
    /// Bytes sent ahead of the first frame
    noise: Vec<u8>,
}

impl VirtualDevice {
    /// A device with a valid stored identity
    pub fn new(uuid: DeviceId) -> Self {
        Self::with_identity(uuid.into_bytes())
    }

    /// A device storing raw identity bytes, valid or not
    pub fn with_identity(identity: [u8; 16]) -> Self {
        Self {
            identity,
            run_id: RunId::new([0; 8]),
            boot_requests: 0,
            noise: Vec::new(),
        }
    }

    /// A device whose stored identity is blank
    pub fn broken() -> Self {
        Self::with_identity([0; 16])
    }

    /// Set the run-id the device reports
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    /// Ignore the first `requests` identify requests
    pub fn booting_for(mut self, requests: u32) -> Self {
        self.boot_requests = requests;
        self
    }

    /// Prefix the first answer with garbage
    pub fn with_noise(mut self, noise: impl Into<Vec<u8>>) -> Self {
        self.noise = noise.into();
        self
    }

    /// Identity as a device id, `None` if broken
    pub fn device_id(&self) -> Option<DeviceId> {
        DeviceId::from_identity_bytes(self.identity)
    }

    /// Run-id currently reported
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Store a new run-id, as a worker does on `connect`
    pub fn set_run_id(&mut self, run_id: RunId) {
        self.run_id = run_id;
    }

    /// Store a new identity, as a worker does on `reset_uuid`
    pub fn set_identity(&mut self, uuid: DeviceId) {
        self.identity = uuid.into_bytes();
    }

    /// The frame this device answers `Id` with
    pub fn frame(&self) -> [u8; FRAME_LEN] {
        IdentifyFrame::new(SingleCommand::Id, self.run_id, self.identity).encode()
    }

    /// Feed bytes written by the host; returns what the device answers
    pub fn process_input(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for _ in data.iter().filter(|&&b| b == SingleCommand::Id.as_byte()) {
            if self.boot_requests > 0 {
                self.boot_requests -= 1;
                continue;
            }
            out.append(&mut self.noise);
            out.extend_from_slice(&self.frame());
        }
        out
    }
}

/// Serve `device` over `stream` until the host closes it
pub async fn run_virtual_device<S>(mut stream: S, mut device: VirtualDevice) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 64];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            debug!("Virtual device link closed");
            return Ok(());
        }
        let answer = device.process_input(&buf[..n]);
        if !answer.is_empty() {
            stream.write_all(&answer).await?;
            stream.flush().await?;
        }
    }
}

/// Read and discard everything written to `stream`, never answering
pub async fn run_silent_device<S>(mut stream: S) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    while stream.read(&mut buf).await? > 0 {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use franklin_protocol::FrameAssembler;

    #[test]
    fn test_answers_each_id() {
        let uuid = DeviceId::generate();
        let mut device = VirtualDevice::new(uuid);
        let out = device.process_input(&[SingleCommand::Id.as_byte(), 0x00]);
        assert_eq!(out.len(), FRAME_LEN);

        let mut assembler = FrameAssembler::new();
        assembler.push_bytes(&out);
        let frame = assembler.next_frame().unwrap();
        assert_eq!(frame.device_id(), Some(uuid));
    }

    #[test]
    fn test_booting_device_stays_quiet() {
        let mut device = VirtualDevice::broken().booting_for(2);
        let id = [SingleCommand::Id.as_byte()];
        assert!(device.process_input(&id).is_empty());
        assert!(device.process_input(&id).is_empty());
        assert_eq!(device.process_input(&id).len(), FRAME_LEN);
        assert_eq!(device.device_id(), None);
    }

    #[test]
    fn test_noise_only_once() {
        let mut device = VirtualDevice::broken().with_noise(vec![1, 2, 3]);
        let id = [SingleCommand::Id.as_byte()];
        assert_eq!(device.process_input(&id).len(), FRAME_LEN + 3);
        assert_eq!(device.process_input(&id).len(), FRAME_LEN);
    }
}
