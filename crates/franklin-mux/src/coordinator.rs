//! Coordinator actor
//!
//! One task owns every piece of mutable state: the port registry, the
//! running printers, the open sessions, the autodetect flag and pending
//! firmware uploads. Session handles and the server talk to it through
//! [`CoordinatorCommand`]s; the tasks it spawns (detection, worker I/O,
//! flashing) report back on an internal channel.
//!
//! Work that must not run inside the call that scheduled it (re-detecting a
//! port after a disconnect, failing a caller whose write could not be
//! queued) goes on a next-tick queue that is drained after every command.
//!
//! # Example
//!
//! ```rust,ignore
//! use franklin_mux::{run_coordinator, CoordinatorCommand, CoordinatorConfig};
//! use tokio::sync::mpsc;
//!
//! let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
//! tokio::spawn(run_coordinator(CoordinatorConfig::default(), backend, cmd_rx));
//!
//! cmd_tx.send(CoordinatorCommand::AddPort("/dev/ttyUSB0".into())).unwrap();
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};

use franklin_detect::Identifier;
use franklin_protocol::{DeviceId, DeviceMethod, RunId, RunIdGenerator};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::backend::{Backend, WorkerArgs};
use crate::config::CoordinatorConfig;
use crate::connection::{ConnectionId, Connections, Role};
use crate::detection::DetectionOutcome;
use crate::error::MuxError;
use crate::events::{PortStatus, ServerEvent};
use crate::firmware::{aborted_reply, upload_options};
use crate::printer::{Continuation, Printer, Reply, Waiter, WorkerEvent};
use crate::registry::{BusyKind, PortRegistry, PrinterKey};
use crate::router::SessionRequest;
use crate::supervisor::PortFate;

/// Commands sent to the coordinator
#[derive(Debug)]
pub enum CoordinatorCommand {
    /// Open a session
    OpenSession {
        /// Access level of the session
        role: Role,
        /// Where events for the session go
        events: mpsc::UnboundedSender<ServerEvent>,
        /// Receives the connection id
        response: oneshot::Sender<ConnectionId>,
    },

    /// Close a session
    CloseSession(ConnectionId),

    /// Request made by a session
    Request {
        /// Originating session
        conn: ConnectionId,
        /// The request
        request: SessionRequest,
        /// Receives the outcome
        reply: Reply,
    },

    /// Register a port
    AddPort(String),

    /// Forget a port
    RemovePort(String),

    /// Run detection on a port
    Detect(String),

    /// Start a detached worker
    CreatePrinter {
        /// Identity to use, `None` to mint one
        uuid: Option<DeviceId>,
        /// Receives the identity of the printer
        response: oneshot::Sender<Result<DeviceId, MuxError>>,
    },

    /// Snapshot of ports and printers
    Status(oneshot::Sender<CoordinatorStatus>),

    /// Stop the coordinator and kill every worker
    Shutdown,
}

/// Reports from tasks spawned by the coordinator
#[derive(Debug)]
pub(crate) enum TaskEvent {
    Worker(PrinterKey, WorkerEvent),
    Detection {
        port: String,
        attempt: u64,
        outcome: DetectionOutcome,
    },
    Flash {
        port: String,
        attempt: u64,
        result: Result<(), String>,
    },
}

/// Work scheduled for the next tick
#[derive(Debug)]
enum Deferred {
    Detect(String),
    WriteFailure { key: PrinterKey, waiter: Waiter },
}

/// A running firmware upload waiting for its reply
#[derive(Debug)]
pub(crate) struct PendingUpload {
    pub attempt: u64,
    pub board: String,
    pub reply: Reply,
}

/// Summary of one running printer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterSummary {
    /// Identity, if known yet
    pub uuid: Option<DeviceId>,
    /// Name reported by the worker
    pub name: Option<String>,
    /// Port the printer is bound to
    pub port: Option<String>,
}

/// Snapshot of the coordinator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    /// Autodetect flag
    pub autodetect: bool,
    /// Every known port with its state
    pub ports: Vec<(String, PortStatus)>,
    /// Every running printer
    pub printers: Vec<PrinterSummary>,
    /// Number of open sessions
    pub sessions: usize,
}

impl CoordinatorStatus {
    /// State of `port`, if known
    pub fn port(&self, port: &str) -> Option<PortStatus> {
        self.ports
            .iter()
            .find(|(name, _)| name == port)
            .map(|(_, state)| *state)
    }

    /// Summary of the printer with `uuid`
    pub fn printer(&self, uuid: DeviceId) -> Option<&PrinterSummary> {
        self.printers.iter().find(|p| p.uuid == Some(uuid))
    }
}

pub(crate) struct Coordinator {
    pub(crate) config: CoordinatorConfig,
    pub(crate) backend: Backend,
    pub(crate) identifier: Identifier,
    pub(crate) registry: PortRegistry,
    pub(crate) printers: BTreeMap<PrinterKey, Printer>,
    pub(crate) connections: Connections,
    pub(crate) autodetect: bool,
    pub(crate) default_printer: Option<DeviceId>,
    pub(crate) run_ids: RunIdGenerator,
    pub(crate) uploads: HashMap<String, PendingUpload>,
    pub(crate) tasks: mpsc::UnboundedSender<TaskEvent>,
    next_key: u64,
    deferred: VecDeque<Deferred>,
}

/// Run the coordinator until [`CoordinatorCommand::Shutdown`] arrives or
/// every command sender is dropped
pub async fn run_coordinator(
    config: CoordinatorConfig,
    backend: Backend,
    mut cmd_rx: mpsc::UnboundedReceiver<CoordinatorCommand>,
) {
    let (task_tx, mut task_rx) = mpsc::unbounded_channel();
    let mut coordinator = Coordinator::new(config, backend, task_tx);
    info!("Coordinator started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(CoordinatorCommand::Shutdown) | None => break,
                Some(cmd) => coordinator.handle_command(cmd),
            },
            Some(event) = task_rx.recv() => coordinator.handle_task_event(event),
        }
        coordinator.run_deferred();
    }

    coordinator.shutdown();
    info!("Coordinator stopped");
}

impl Coordinator {
    pub(crate) fn new(
        config: CoordinatorConfig,
        backend: Backend,
        tasks: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        Self {
            identifier: Identifier::with_config(config.handshake.clone()),
            registry: PortRegistry::new(config.blacklist.clone()),
            autodetect: config.autodetect,
            default_printer: config.default_printer,
            config,
            backend,
            printers: BTreeMap::new(),
            connections: Connections::default(),
            run_ids: RunIdGenerator::new(),
            uploads: HashMap::new(),
            tasks,
            next_key: 0,
            deferred: VecDeque::new(),
        }
    }

    fn handle_command(&mut self, cmd: CoordinatorCommand) {
        match cmd {
            CoordinatorCommand::OpenSession {
                role,
                events,
                response,
            } => {
                let printer = self.default_printer.filter(|uuid| self.is_running(*uuid));
                let id = self.connections.open(role, printer, events);
                debug!("Opened {} session {}", role, id);
                let _ = response.send(id);
            }
            CoordinatorCommand::CloseSession(id) => {
                if self.connections.close(id) {
                    debug!("Closed session {}", id);
                }
            }
            CoordinatorCommand::Request {
                conn,
                request,
                reply,
            } => self.handle_request(conn, request, reply),
            CoordinatorCommand::AddPort(port) => self.add_port(&port),
            CoordinatorCommand::RemovePort(port) => self.remove_port(&port),
            CoordinatorCommand::Detect(port) => self.detect(&port),
            CoordinatorCommand::CreatePrinter { uuid, response } => {
                let _ = response.send(self.create_printer(uuid));
            }
            CoordinatorCommand::Status(response) => {
                let _ = response.send(self.status());
            }
            // handled by the run loop
            CoordinatorCommand::Shutdown => {}
        }
    }

    fn handle_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Worker(key, event) => self.handle_worker_event(key, event),
            TaskEvent::Detection {
                port,
                attempt,
                outcome,
            } => self.detection_done(port, attempt, outcome),
            TaskEvent::Flash {
                port,
                attempt,
                result,
            } => self.flash_done(port, attempt, result),
        }
    }

    fn run_deferred(&mut self) {
        while let Some(work) = self.deferred.pop_front() {
            match work {
                Deferred::Detect(port) => self.detect(&port),
                Deferred::WriteFailure { key, waiter } => {
                    let message = self
                        .worker_died(key, "because of a write error", PortFate::Release)
                        .unwrap_or_else(|| format!("Printer {key} is gone"));
                    self.resolve(key, waiter, Err(MuxError::PrinterDied(message)));
                }
            }
        }
    }

    pub(crate) fn defer_detect(&mut self, port: &str) {
        self.deferred.push_back(Deferred::Detect(port.to_string()));
    }

    pub(crate) fn broadcast(&self, target: Option<ConnectionId>, event: ServerEvent) {
        self.connections.broadcast(target, event);
    }

    pub(crate) fn announce(&self, port: &str, state: PortStatus) {
        self.broadcast(None, ServerEvent::port_state(port, state));
    }

    pub(crate) fn find_printer(&self, uuid: DeviceId) -> Option<PrinterKey> {
        self.printers
            .values()
            .find(|p| p.uuid == Some(uuid))
            .map(|p| p.key)
    }

    pub(crate) fn is_running(&self, uuid: DeviceId) -> bool {
        self.find_printer(uuid).is_some()
    }

    /// Send a call to a printer. A printer that is gone fails the waiter at
    /// once; a closed writer fails it on the next tick.
    pub(crate) fn call(
        &mut self,
        key: PrinterKey,
        method: DeviceMethod,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        waiter: Waiter,
    ) {
        let Some(printer) = self.printers.get_mut(&key) else {
            self.resolve(
                key,
                waiter,
                Err(MuxError::PrinterDied(format!("Printer {key} is gone"))),
            );
            return;
        };
        if let Err(waiter) = printer.call(method, args, kwargs, waiter) {
            self.deferred.push_back(Deferred::WriteFailure { key, waiter });
        }
    }

    /// [`Coordinator::call`] on behalf of the server itself
    pub(crate) fn admin_call(
        &mut self,
        key: PrinterKey,
        method: DeviceMethod,
        args: Vec<Value>,
        waiter: Waiter,
    ) {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(json!(Role::Admin.as_str()));
        full.extend(args);
        self.call(key, method, full, Map::new(), waiter);
    }

    /// Hand a reply to whoever waits for it
    pub(crate) fn resolve(
        &mut self,
        key: PrinterKey,
        waiter: Waiter,
        result: Result<Value, MuxError>,
    ) {
        match waiter {
            Waiter::Session(reply) => {
                let _ = reply.send(result);
            }
            Waiter::Internal(continuation) => {
                if self.printers.contains_key(&key) {
                    self.continue_with(key, continuation, result);
                } else {
                    debug!("Dropping {:?} of printer {} which is gone", continuation, key);
                }
            }
            Waiter::Ignore => {}
        }
    }

    /// Start a worker and register its printer
    pub(crate) fn start_printer(
        &mut self,
        args: WorkerArgs,
        run_id: Option<RunId>,
    ) -> Result<PrinterKey, MuxError> {
        let process = self.backend.spawner.spawn(&args)?;
        let key = PrinterKey(self.next_key);
        self.next_key += 1;

        let mut printer = Printer::start(key, process, args.port.clone(), run_id, self.tasks.clone());
        printer.uuid = args.uuid;
        info!("Started printer {} ({:?})", printer.label(), args.port);
        self.printers.insert(key, printer);

        if let Some(port) = &args.port {
            self.announce(port, PortStatus::Detecting);
        }
        self.admin_call(
            key,
            DeviceMethod::GetGlobals,
            Vec::new(),
            Waiter::Internal(Continuation::GotGlobals { port: args.port }),
        );
        Ok(key)
    }

    /// Start a detached worker for `uuid`, minting one if needed
    pub(crate) fn create_printer(&mut self, uuid: Option<DeviceId>) -> Result<DeviceId, MuxError> {
        let uuid = uuid.unwrap_or_else(DeviceId::generate);
        if self.is_running(uuid) {
            debug!("Printer {} is already running", uuid);
            return Ok(uuid);
        }
        let args = WorkerArgs {
            uuid: Some(uuid),
            port: None,
            allow_system: self.config.allow_system.clone(),
        };
        self.start_printer(args, None)?;
        Ok(uuid)
    }

    pub(crate) fn add_port(&mut self, port: &str) {
        if !self.registry.insert(port) {
            return;
        }
        info!("Added port {}", port);
        self.broadcast(
            None,
            ServerEvent::NewPort {
                port: port.to_string(),
                options: upload_options(port, &self.config.boards),
            },
        );
        self.announce(port, PortStatus::Idle);
        if self.autodetect {
            self.detect(port);
        }
    }

    pub(crate) fn remove_port(&mut self, port: &str) {
        if !self.registry.contains(port) {
            debug!("Not removing unknown port {}", port);
            return;
        }
        info!("Removing port {}", port);
        if let Some(key) = self.registry.bound_to(port) {
            self.disable_key(key, "port removed");
        }
        self.cancel_busy(port);
        self.registry.remove(port);
        self.broadcast(
            None,
            ServerEvent::DelPort {
                port: port.to_string(),
            },
        );
    }

    /// Detach a printer from its port. Disabling a printer that has no
    /// port changes nothing.
    pub(crate) fn disable(&mut self, uuid: DeviceId, reason: &str) -> Result<(), MuxError> {
        let Some(key) = self.find_printer(uuid) else {
            debug!("Not disabling nonexistent printer {}", uuid);
            return Err(MuxError::PrinterNotFound(uuid));
        };
        if self.disable_key(key, reason) {
            Ok(())
        } else {
            Err(MuxError::NotEnabled(uuid))
        }
    }

    pub(crate) fn disable_key(&mut self, key: PrinterKey, reason: &str) -> bool {
        let Some(printer) = self.printers.get_mut(&key) else {
            return false;
        };
        let Some(port) = printer.port.take() else {
            debug!("Not disabling printer {} which isn't enabled", printer.label());
            return false;
        };
        info!("Disabling {} on {}: {}", printer.label(), port, reason);
        self.admin_call(key, DeviceMethod::Disconnect, vec![json!(reason)], Waiter::Ignore);
        if self.registry.release(&port, key) {
            self.announce(&port, PortStatus::Idle);
        }
        true
    }

    /// Cancel whatever keeps `port` busy; the port is left idle
    pub(crate) fn cancel_busy(&mut self, port: &str) {
        let Some(handle) = self.registry.take_busy(port) else {
            return;
        };
        let kind = handle.kind();
        handle.cancel();
        debug!("Cancelled {:?} on {}", kind, port);
        if kind == BusyKind::Flashing {
            if let Some(upload) = self.uploads.remove(port) {
                let _ = upload
                    .reply
                    .send(Ok(Value::String(aborted_reply(&upload.board))));
            }
        }
    }

    pub(crate) fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            autodetect: self.autodetect,
            ports: self
                .registry
                .ports()
                .map(|(port, state)| (port.to_string(), state.status()))
                .collect(),
            printers: self
                .printers
                .values()
                .map(|p| PrinterSummary {
                    uuid: p.uuid,
                    name: p.name.clone(),
                    port: p.port.clone(),
                })
                .collect(),
            sessions: self.connections.len(),
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down {} printers", self.printers.len());
        for port in self.registry.ports().map(|(p, _)| p.to_string()).collect::<Vec<_>>() {
            self.cancel_busy(&port);
        }
        let printers = std::mem::take(&mut self.printers);
        for (key, mut printer) in printers {
            printer.kill();
            let message = format!("Printer {} died because the server stopped", printer.label());
            for waiter in printer.waiters.drain() {
                if let Waiter::Session(reply) = waiter {
                    let _ = reply.send(Err(MuxError::PrinterDied(message.clone())));
                }
            }
            debug!("Stopped printer {}", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BoxFuture, BoxedLink, FirmwareFlasher, PortOpener, WorkerProcess, WorkerSpawner};
    use crate::firmware::FlashRequest;
    use franklin_detect::{DetectError, PortFilter};
    use std::sync::Arc;

    struct Unplugged;

    impl PortOpener for Unplugged {
        fn predetect<'a>(&'a self, _port: &'a str) -> BoxFuture<'a, ()> {
            Box::pin(async {})
        }

        fn open(&self, port: &str, _baud_rate: u32) -> Result<BoxedLink, DetectError> {
            Err(DetectError::OpenFailed {
                port: port.to_string(),
                reason: "unplugged".into(),
            })
        }
    }

    impl WorkerSpawner for Unplugged {
        fn spawn(&self, _args: &WorkerArgs) -> Result<WorkerProcess, MuxError> {
            Err(MuxError::SpawnFailed("no workers in this test".into()))
        }
    }

    impl FirmwareFlasher for Unplugged {
        fn flash(&self, _request: FlashRequest) -> BoxFuture<'static, Result<(), String>> {
            Box::pin(std::future::pending())
        }
    }

    fn coordinator(autodetect: bool) -> (Coordinator, mpsc::UnboundedReceiver<TaskEvent>) {
        let shared = Arc::new(Unplugged);
        let backend = Backend::new(shared.clone(), shared.clone(), shared);
        let config = CoordinatorConfig {
            autodetect,
            blacklist: PortFilter::new(&["/dev/ttyS*"]).unwrap(),
            ..CoordinatorConfig::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (Coordinator::new(config, backend, tx), rx)
    }

    fn monitor(c: &mut Coordinator) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = c.connections.open(Role::Admin, None, tx);
        let conn = c.connections.get_mut(id).unwrap();
        conn.monitor = true;
        conn.initialized = true;
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_add_and_remove_port() {
        let (mut c, _tasks) = coordinator(false);
        let mut events = monitor(&mut c);

        c.add_port("/dev/ttyUSB0");
        c.add_port("/dev/ttyUSB0");
        c.add_port("/dev/ttyS1");

        assert_eq!(
            drain(&mut events),
            vec![
                ServerEvent::NewPort {
                    port: "/dev/ttyUSB0".into(),
                    options: vec![]
                },
                ServerEvent::port_state("/dev/ttyUSB0", PortStatus::Idle),
            ]
        );

        c.remove_port("/dev/ttyUSB0");
        c.remove_port("/dev/ttyUSB0");
        assert_eq!(
            drain(&mut events),
            vec![ServerEvent::DelPort {
                port: "/dev/ttyUSB0".into()
            }]
        );
        assert!(c.registry.is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_removes_port() {
        let (mut c, mut tasks) = coordinator(true);
        let mut events = monitor(&mut c);

        c.add_port("/dev/ttyUSB0");
        assert_eq!(c.status().port("/dev/ttyUSB0"), Some(PortStatus::Detecting));

        let event = tasks.recv().await.unwrap();
        c.handle_task_event(event);

        assert!(!c.registry.contains("/dev/ttyUSB0"));
        let events = drain(&mut events);
        assert_eq!(
            events.last(),
            Some(&ServerEvent::DelPort {
                port: "/dev/ttyUSB0".into()
            })
        );
    }

    #[tokio::test]
    async fn test_synthetic_spawn_failure_idles_port() {
        let (mut c, _tasks) = coordinator(false);
        c.add_port("-sim");
        c.detect("-sim");
        assert_eq!(c.status().port("-sim"), Some(PortStatus::Idle));
        assert!(c.printers.is_empty());
    }

    #[tokio::test]
    async fn test_disable_unknown_printer_is_noop() {
        let (mut c, _tasks) = coordinator(false);
        let mut events = monitor(&mut c);
        let uuid = DeviceId::generate();
        assert!(matches!(c.disable(uuid, "test"), Err(MuxError::PrinterNotFound(u)) if u == uuid));
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_create_printer_spawn_failure() {
        let (mut c, _tasks) = coordinator(false);
        assert!(matches!(c.create_printer(None), Err(MuxError::SpawnFailed(_))));
        assert!(c.printers.is_empty());
    }
}
