//! Identify handshake
//!
//! A freshly opened port is asked for its identity by writing the single
//! `Id` command. The device answers with a 34-byte identify frame. A booting
//! device may stay silent for a while, so the request is repeated on every
//! tick during which nothing arrived, until the retry budget runs out.

use std::time::Duration;

use franklin_protocol::{DeviceId, FrameAssembler, IdentifyFrame, RunId, SingleCommand};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

use crate::error::DetectError;

/// Baud rate used for every identify handshake
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Configuration for the handshake
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Quiet period before the first `Id` on ports that need it
    pub warmup: Duration,
    /// Tick period between retries
    pub retry_interval: Duration,
    /// Ticks after which the handshake gives up
    pub max_retries: u32,
    /// Ports whose path contains this get the warm-up delay
    pub warmup_pattern: String,
    /// Baud rate to open ports at
    pub baud_rate: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_millis(1500),
            retry_interval: Duration::from_millis(500),
            max_retries: 30,
            warmup_pattern: "ACM".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Result of a successful handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identification {
    /// The validated frame
    pub frame: IdentifyFrame,
}

impl Identification {
    /// Run-id reported by the device
    pub fn run_id(&self) -> RunId {
        self.frame.run_id
    }

    /// Device identity, `None` when the stored identity is broken
    pub fn device_id(&self) -> Option<DeviceId> {
        self.frame.device_id()
    }
}

/// Runs the identify handshake over any byte link
#[derive(Debug, Clone, Default)]
pub struct Identifier {
    config: HandshakeConfig,
}

impl Identifier {
    /// Create an identifier with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an identifier with custom configuration
    pub fn with_config(config: HandshakeConfig) -> Self {
        Self { config }
    }

    /// Current configuration
    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Wait out the warm-up period if the port needs one.
    ///
    /// Bootloaders on CDC-ACM boards treat early traffic as a reprogramming
    /// attempt.
    pub async fn warm_up(&self, port: &str) {
        if needs_warmup(port, &self.config.warmup_pattern) {
            debug!("Waiting {:?} before talking to {}", self.config.warmup, port);
            sleep(self.config.warmup).await;
        }
    }

    /// Ask the device on `stream` for its identity
    pub async fn identify<S>(&self, stream: &mut S, port: &str) -> Result<Identification, DetectError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut assembler = FrameAssembler::new();
        let mut buf = [0u8; 64];
        let mut retries = 0u32;
        let mut had_data = false;

        self.send_id(stream, port).await?;

        let start = Instant::now() + self.config.retry_interval;
        let mut ticker = interval_at(start, self.config.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    retries += 1;
                    if retries >= self.config.max_retries {
                        info!("Timeout waiting for device on port {}; giving up", port);
                        return Err(DetectError::Timeout {
                            port: port.to_string(),
                            retries,
                        });
                    }
                    if had_data {
                        had_data = false;
                    } else {
                        trace!("No data from {} (retry {}), resending id", port, retries);
                        self.send_id(stream, port).await?;
                    }
                }
                read = stream.read(&mut buf) => {
                    match read {
                        Ok(0) => {
                            warn!("Link to {} closed during detection", port);
                            return Err(DetectError::Closed(port.to_string()));
                        }
                        Ok(n) => {
                            had_data = true;
                            assembler.push_bytes(&buf[..n]);
                            if let Some(frame) = assembler.next_frame() {
                                debug!("Identify frame from {}: run-id {}", port, frame.run_id);
                                return Ok(Identification { frame });
                            }
                        }
                        Err(e) => {
                            warn!("Error during detection on port {}: {}", port, e);
                            return Err(DetectError::IoError {
                                port: port.to_string(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn send_id<S>(&self, stream: &mut S, port: &str) -> Result<(), DetectError>
    where
        S: AsyncWrite + Unpin,
    {
        let io_error = |e: std::io::Error| DetectError::IoError {
            port: port.to_string(),
            reason: e.to_string(),
        };
        stream.write_all(&SingleCommand::Id.encode()).await.map_err(io_error)?;
        stream.flush().await.map_err(io_error)
    }
}

/// Whether `port` gets the warm-up delay
pub fn needs_warmup(port: &str, pattern: &str) -> bool {
    !pattern.is_empty() && port.contains(pattern)
}

/// Synthetic ports are served by a worker without any serial handshake
pub fn is_synthetic_port(port: &str) -> bool {
    port.starts_with('-') || port.starts_with('!')
}

/// Open a serial port for the handshake
pub fn open_link(path: &str, baud_rate: u32) -> Result<SerialStream, DetectError> {
    tokio_serial::new(path, baud_rate)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .map_err(|e| DetectError::OpenFailed {
            port: path.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn sample_frame(identity: [u8; 16]) -> IdentifyFrame {
        IdentifyFrame::new(
            SingleCommand::Id,
            RunId::new([0x40, 0xe1, 0xd2, 0x73, 0x74, 0xd5, 0xe6, 0x47]),
            identity,
        )
    }

    #[test]
    fn test_port_classification() {
        assert!(needs_warmup("/dev/ttyACM0", "ACM"));
        assert!(!needs_warmup("/dev/ttyUSB0", "ACM"));
        assert!(!needs_warmup("/dev/ttyACM0", ""));
        assert!(is_synthetic_port("-sim"));
        assert!(is_synthetic_port("!replay"));
        assert!(!is_synthetic_port("/dev/ttyUSB0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_valid_device() {
        let (mut host, mut device) = duplex(256);
        let id = DeviceId::generate();
        let frame = sample_frame(id.into_bytes());

        let responder = tokio::spawn(async move {
            let mut cmd = [0u8; 1];
            device.read_exact(&mut cmd).await.unwrap();
            assert_eq!(cmd[0], SingleCommand::Id.as_byte());
            // leftover noise before the frame
            device.write_all(&[0x00, 0x13]).await.unwrap();
            device.write_all(&frame.encode()).await.unwrap();
            device
        });

        let result = Identifier::new().identify(&mut host, "/dev/ttyUSB0").await.unwrap();
        assert_eq!(result.device_id(), Some(id));
        assert_eq!(result.run_id(), frame.run_id);
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_identity_is_anonymous() {
        let (mut host, mut device) = duplex(256);
        let frame = sample_frame([0u8; 16]);

        tokio::spawn(async move {
            let mut cmd = [0u8; 1];
            device.read_exact(&mut cmd).await.unwrap();
            device.write_all(&frame.encode()).await.unwrap();
            // keep the link open until the host is done
            let _ = device.read(&mut cmd).await;
        });

        let result = Identifier::new().identify(&mut host, "-").await.unwrap();
        assert!(result.device_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let (mut host, mut device) = duplex(256);

        let counter = tokio::spawn(async move {
            let mut requests = 0usize;
            let mut buf = [0u8; 16];
            while let Ok(n) = device.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                requests += n;
            }
            requests
        });

        let start = Instant::now();
        let err = Identifier::new()
            .identify(&mut host, "COM_TEST")
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::Timeout { retries: 30, .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(15));

        drop(host);
        // initial request plus one per silent tick before giving up
        assert_eq!(counter.await.unwrap(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_link() {
        let (mut host, device) = duplex(16);
        drop(device);
        let err = Identifier::new().identify(&mut host, "/dev/x").await.unwrap_err();
        assert!(matches!(err, DetectError::IoError { .. } | DetectError::Closed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_up_only_for_acm() {
        let identifier = Identifier::new();

        let start = Instant::now();
        identifier.warm_up("/dev/ttyUSB0").await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        identifier.warm_up("/dev/ttyACM0").await;
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }
}
