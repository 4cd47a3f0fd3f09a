//! Detection engine
//!
//! Detection on a real port runs as a task that owns the link: pre-detect
//! command, open, warm-up and the identify handshake. Aborting the task
//! drops the link and every timer with it. The outcome is reported back to
//! the coordinator, which resolves the identity against the running
//! printers:
//!
//! 1. the run-id belongs to a running printer: the device kept running and
//!    only its link went away, so the printer is told to reconnect;
//! 2. the identity belongs to a running printer: the device was reset and
//!    gets a fresh run-id;
//! 3. anything else starts a new worker, minting an identity for devices
//!    whose stored one is broken.

use std::sync::Arc;

use franklin_detect::{is_synthetic_port, DetectError, Identification, Identifier};
use franklin_protocol::{DeviceId, DeviceMethod, RunId};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backend::{BoxedLink, PortOpener, WorkerArgs};
use crate::coordinator::{Coordinator, TaskEvent};
use crate::events::{PortStatus, ServerEvent};
use crate::printer::{Continuation, Waiter};
use crate::registry::{BusyHandle, BusyKind, PortState, PrinterKey};
use crate::storage;

/// What a detection task found
pub(crate) enum DetectionOutcome {
    /// The port could not be opened
    OpenFailed(DetectError),
    /// The port opened but no valid identify frame arrived
    Failed(DetectError),
    /// A device answered
    Identified {
        identification: Identification,
        link: BoxedLink,
    },
}

impl std::fmt::Debug for DetectionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionOutcome::OpenFailed(e) => f.debug_tuple("OpenFailed").field(e).finish(),
            DetectionOutcome::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
            DetectionOutcome::Identified { identification, .. } => f
                .debug_struct("Identified")
                .field("identification", identification)
                .finish_non_exhaustive(),
        }
    }
}

async fn detect_on(port: &str, opener: &dyn PortOpener, identifier: &Identifier) -> DetectionOutcome {
    opener.predetect(port).await;
    let mut link = match opener.open(port, identifier.config().baud_rate) {
        Ok(link) => link,
        Err(e) => return DetectionOutcome::OpenFailed(e),
    };
    identifier.warm_up(port).await;
    match identifier.identify(&mut link, port).await {
        Ok(identification) => DetectionOutcome::Identified {
            identification,
            link,
        },
        Err(e) => DetectionOutcome::Failed(e),
    }
}

async fn run_detection(
    port: String,
    attempt: u64,
    opener: Arc<dyn PortOpener>,
    identifier: Identifier,
    tasks: mpsc::UnboundedSender<TaskEvent>,
) {
    let outcome = detect_on(&port, opener.as_ref(), &identifier).await;
    let _ = tasks.send(TaskEvent::Detection {
        port,
        attempt,
        outcome,
    });
}

impl Coordinator {
    /// Start detection on `port`, taking it over from whatever holds it
    pub(crate) fn detect(&mut self, port: &str) {
        let Some(state) = self.registry.state(port) else {
            warn!("Not detecting on unknown port {}", port);
            return;
        };
        info!("Detecting printer on {}", port);

        let bound = match state {
            PortState::Bound(key) => Some(*key),
            _ => None,
        };
        if let Some(key) = bound {
            self.disable_key(key, "disabled to prepare for detection");
        }
        self.cancel_busy(port);
        if !self.registry.state(port).is_some_and(PortState::is_idle) {
            error!("BUG: port {} is not in detectable state", port);
            return;
        }

        self.announce(port, PortStatus::Detecting);
        if is_synthetic_port(port) {
            self.start_synthetic(port);
            return;
        }

        let attempt = self.registry.next_attempt();
        let task = tokio::spawn(run_detection(
            port.to_string(),
            attempt,
            self.backend.opener.clone(),
            self.identifier.clone(),
            self.tasks.clone(),
        ));
        self.registry.set_busy(
            port,
            BusyHandle::new(BusyKind::Detecting, attempt, task.abort_handle()),
        );
    }

    fn start_synthetic(&mut self, port: &str) {
        let run_id = self.run_ids.next_id();
        let args = WorkerArgs {
            uuid: None,
            port: Some(port.to_string()),
            allow_system: self.config.allow_system.clone(),
        };
        match self.start_printer(args, Some(run_id)) {
            Ok(key) => self.registry.bind(port, key),
            Err(e) => {
                warn!("Failed to start worker for {}: {}", port, e);
                self.announce(port, PortStatus::Idle);
            }
        }
    }

    pub(crate) fn detection_done(&mut self, port: String, attempt: u64, outcome: DetectionOutcome) {
        if self.registry.clear_busy(&port, attempt).is_none() {
            debug!("Discarding stale detection result for {}", port);
            return;
        }
        match outcome {
            DetectionOutcome::OpenFailed(e) => {
                warn!("Removing port {}: {}", port, e);
                self.registry.remove(&port);
                self.broadcast(None, ServerEvent::DelPort { port });
            }
            DetectionOutcome::Failed(e) => {
                info!("No printer found on {}: {}", port, e);
                self.announce(&port, PortStatus::Idle);
            }
            DetectionOutcome::Identified {
                identification,
                link,
            } => self.resolve_identity(&port, identification, link),
        }
    }

    fn resolve_identity(&mut self, port: &str, identification: Identification, link: BoxedLink) {
        let run_id = identification.run_id();
        let uuid = identification.device_id();
        debug!("Device on {} has run-id {} and identity {:?}", port, run_id, uuid);

        let live = self
            .printers
            .values()
            .find(|p| p.run_id == Some(run_id) && (uuid.is_none() || p.uuid == uuid))
            .map(|p| p.key);
        if let Some(key) = live {
            self.reconnect_live(key, port, link);
            return;
        }

        if let Some(key) = uuid.and_then(|uuid| self.find_printer(uuid)) {
            self.adopt_returning(key, port, link);
            return;
        }

        self.start_detected(port, uuid, link);
    }

    fn reconnect_live(&mut self, key: PrinterKey, port: &str, link: BoxedLink) {
        self.disable_key(key, "disabled printer which was detected on different port");
        let Some(printer) = self.printers.get_mut(&key) else {
            return;
        };
        info!("Reconnecting {} to {}", printer.label(), port);
        printer.port = Some(port.to_string());
        printer.detect_link = Some(link);
        self.registry.bind(port, key);
        self.admin_call(
            key,
            DeviceMethod::Reconnect,
            vec![json!(port)],
            Waiter::Internal(Continuation::ReconnectDone {
                port: port.to_string(),
            }),
        );
        self.announce(port, PortStatus::Connected);
    }

    fn adopt_returning(&mut self, key: PrinterKey, port: &str, link: BoxedLink) {
        let run_id = self.run_ids.next_id();
        let Some(printer) = self.printers.get_mut(&key) else {
            return;
        };
        info!("Printer {} returned on {}", printer.label(), port);
        let previous = printer.port.replace(port.to_string());
        printer.run_id = Some(run_id);
        printer.detect_link = Some(link);

        // the worker reports its own disconnect, so no disconnect call here
        if let Some(previous) = previous {
            if self.registry.release(&previous, key) {
                self.announce(&previous, PortStatus::Idle);
            }
        }
        self.registry.bind(port, key);
        self.connect(key, port, run_id, true);
    }

    fn start_detected(&mut self, port: &str, uuid: Option<DeviceId>, link: BoxedLink) {
        match uuid {
            None => info!("Device on {} has no valid identity; assigning one", port),
            Some(uuid) if self.is_persisted(uuid) => {
                info!("Starting stored printer {} on {}", uuid, port)
            }
            Some(uuid) => info!("Starting new printer {} on {}", uuid, port),
        }

        let run_id = self.run_ids.next_id();
        let args = WorkerArgs {
            uuid,
            port: Some(port.to_string()),
            allow_system: self.config.allow_system.clone(),
        };
        let key = match self.start_printer(args, Some(run_id)) {
            Ok(key) => key,
            Err(e) => {
                warn!("Failed to start worker for {}: {}", port, e);
                self.announce(port, PortStatus::Idle);
                return;
            }
        };
        self.registry.bind(port, key);
        if let Some(printer) = self.printers.get_mut(&key) {
            printer.detect_link = Some(link);
        }

        match uuid {
            None => self.admin_call(
                key,
                DeviceMethod::ResetUuid,
                Vec::new(),
                Waiter::Internal(Continuation::UuidMinted {
                    port: port.to_string(),
                    run_id,
                }),
            ),
            Some(_) => self.connect(key, port, run_id, false),
        }
    }

    /// Hand the port to the worker under a new run-id
    pub(crate) fn connect(&mut self, key: PrinterKey, port: &str, run_id: RunId, announce: bool) {
        let chars = run_id.to_chars().into_iter().map(Value::String).collect();
        self.admin_call(
            key,
            DeviceMethod::Connect,
            vec![json!(port), Value::Array(chars)],
            Waiter::Internal(Continuation::ConnectDone {
                port: port.to_string(),
                announce,
            }),
        );
    }

    fn is_persisted(&self, uuid: DeviceId) -> bool {
        self.config
            .data_dir
            .as_deref()
            .is_some_and(|dir| storage::is_persisted(dir, uuid))
    }
}
