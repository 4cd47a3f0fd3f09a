//! Franklin Protocol Library
//!
//! This crate provides the wire formats spoken by the Franklin device
//! multiplexer:
//!
//! - **Identify frames**: the fixed 34-byte binary frame a device answers
//!   with when the host sends the single-byte `ID` command over serial
//! - **Worker records**: newline-delimited JSON arrays exchanged with the
//!   per-device worker process
//!
//! # Identify frame layout
//!
//! ```text
//! [command:1][run-id:8][identity:16][checksum:9]
//! ```
//!
//! The checksum covers the first 25 bytes with one check byte per 3-byte
//! group. The identity is a UUID carrying version/variant markers in bytes
//! 7 and 9; anything else is a broken identity.
//!
//! # Example
//!
//! ```rust
//! use franklin_protocol::{DeviceId, FrameAssembler, IdentifyFrame, RunId, SingleCommand};
//!
//! let id = DeviceId::generate();
//! let frame = IdentifyFrame::new(SingleCommand::Id, RunId::new([0x40; 8]), id.into_bytes());
//!
//! let mut assembler = FrameAssembler::new();
//! assembler.push_bytes(&frame.encode());
//!
//! let decoded = assembler.next_frame().unwrap();
//! assert_eq!(decoded.device_id(), Some(id));
//! ```

pub mod checksum;
pub mod command;
pub mod error;
pub mod frame;
pub mod identity;
pub mod message;
pub mod method;

pub use checksum::{check, checksum};
pub use command::SingleCommand;
pub use error::ParseError;
pub use frame::{FrameAssembler, IdentifyFrame, FRAME_LEN, PAYLOAD_LEN};
pub use identity::{DeviceId, RunId, RunIdGenerator};
pub use message::{CallId, LineBuffer, Request, WorkerMessage};
pub use method::DeviceMethod;
