//! Franklin Device Multiplexer
//!
//! This crate owns the server side of the Franklin device server: which
//! serial ports exist, which device sits behind each of them, the worker
//! process that drives every device, and the sessions observing it all.
//!
//! # Architecture
//!
//! A single coordinator task owns all state and is driven by commands:
//!
//! - **Port registry**: each port is idle, busy with a cancellable
//!   operation (detection or firmware upload), or bound to a printer
//! - **Detection**: identify handshake on a fresh port, then resolution of
//!   the reported identity against the running printers
//! - **Supervision**: one worker per printer, JSON line calls matched to
//!   their replies by call-id, and clean teardown when a worker dies
//! - **Broadcasts**: state changes are pushed to every monitoring session
//! - **Sessions**: role-gated requests from clients
//!
//! The outside world (serial ports, worker processes, the flashing tool) is
//! reached through the traits in [`backend`], so the coordinator runs the
//! same against hardware and against simulated devices.
//!
//! # Example
//!
//! ```rust,no_run
//! use franklin_mux::{spawn_coordinator, CoordinatorConfig, Role, SystemBackend};
//!
//! # async fn example() -> Result<(), franklin_mux::MuxError> {
//! let backend = SystemBackend {
//!     driver: "franklin-driver".into(),
//!     ..SystemBackend::default()
//! };
//! let (handle, _task) = spawn_coordinator(CoordinatorConfig::default(), backend.into_backend());
//!
//! handle.add_port("/dev/ttyUSB0")?;
//! let mut session = handle.open_session(Role::Admin).await?;
//! session.set_monitor(true).await?;
//! while let Some(event) = session.next_event().await {
//!     println!("{} {:?}", event.name(), event.args());
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod connection;
pub mod coordinator;
mod detection;
pub mod error;
pub mod events;
pub mod firmware;
pub mod handle;
mod printer;
pub mod registry;
pub mod router;
pub mod storage;
mod supervisor;

pub use backend::{
    Backend, BoxFuture, BoxedLink, FirmwareFlasher, Link, PortOpener, SystemBackend, WorkerArgs,
    WorkerProcess, WorkerSpawner,
};
pub use config::CoordinatorConfig;
pub use connection::{ConnectionId, Role};
pub use coordinator::{run_coordinator, CoordinatorCommand, CoordinatorStatus, PrinterSummary};
pub use error::MuxError;
pub use events::{PortStatus, ServerEvent};
pub use firmware::{BoardSpec, FlashRecipe, FlashRequest, FlashTemplates, UploadOption};
pub use handle::{spawn_coordinator, CoordinatorHandle, Session};
pub use printer::{Reply, WaitTable, WaiterTables};
pub use registry::{PortState, PrinterKey};
pub use router::{SessionRequest, DEFAULT_DISABLE_REASON};
