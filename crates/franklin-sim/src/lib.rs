//! Franklin Simulation Library
//!
//! This crate provides a simulation layer for testing the Franklin
//! multiplexer without physical devices or worker processes. It includes:
//!
//! - **VirtualDevice**: answers the identify handshake like device firmware
//! - **VirtualWorker**: speaks the worker line protocol
//! - **SimBackend**: plugs both (and a fake flashing tool) into the
//!   coordinator's backend traits
//!
//! # Example
//!
//! ```rust
//! use franklin_protocol::{DeviceId, SingleCommand, FRAME_LEN};
//! use franklin_sim::VirtualDevice;
//!
//! let mut device = VirtualDevice::new(DeviceId::generate());
//! let answer = device.process_input(&[SingleCommand::Id.as_byte()]);
//! assert_eq!(answer.len(), FRAME_LEN);
//! ```

pub mod backend;
pub mod device;
pub mod worker;

pub use backend::{DeviceTable, PortBehavior, SimBackend, SimFlasher, SimWorkerHandle};
pub use device::{run_silent_device, run_virtual_device, VirtualDevice};
pub use worker::{run_virtual_worker, RecordedCall, VirtualWorker, WorkerControl, WorkerOutput};
