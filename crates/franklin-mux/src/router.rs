//! Session requests
//!
//! Everything a session can ask for is a [`SessionRequest`] variant. Device
//! calls go through [`SessionRequest::Call`] with a [`DeviceMethod`], so a
//! session can never reach a worker method outside that closed set.

use franklin_protocol::{DeviceId, DeviceMethod};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::connection::{ConnectionId, Role};
use crate::coordinator::{Coordinator, PendingUpload, TaskEvent};
use crate::error::MuxError;
use crate::events::{PortStatus, ServerEvent};
use crate::firmware::{resolve_board, upload_options, upload_reply, FlashRequest, UploadOption};
use crate::printer::{Reply, WaitTable, Waiter};
use crate::registry::{BusyHandle, BusyKind, PrinterKey};

/// Reason used when a session disables a printer without giving one
pub const DEFAULT_DISABLE_REASON: &str = "disabled by user";

/// A request made by a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionRequest {
    /// Turn autodetection on or off
    SetAutodetect(bool),
    /// Read the autodetect flag
    GetAutodetect,
    /// Run detection on a port
    Detect {
        /// Port path
        port: String,
    },
    /// Run detection on every idle port
    DetectAll,
    /// Register a port
    AddPort {
        /// Port path
        port: String,
    },
    /// Forget a port
    RemovePort {
        /// Port path
        port: String,
    },
    /// List known ports
    GetPorts,
    /// Set the printer new sessions start bound to
    SetDefaultPrinter {
        /// Printer identity, `None` to clear
        printer: Option<DeviceId>,
    },
    /// Read the default printer
    GetDefaultPrinter,
    /// Detach a printer from its port
    Disable {
        /// Printer identity
        printer: DeviceId,
        /// Reason passed to the worker
        reason: Option<String>,
    },
    /// Stop a printer and forget it
    RemovePrinter {
        /// Printer identity
        printer: DeviceId,
    },
    /// Start a detached printer and bind the session to it
    CreatePrinter,
    /// Bind the session to a printer
    SetPrinter {
        /// Printer identity, `None` to unbind
        printer: Option<DeviceId>,
    },
    /// Read the bound printer
    GetPrinter,
    /// Turn event delivery on or off; turning it on replays the full state
    SetMonitor(bool),
    /// Read the monitor flag
    GetMonitor,
    /// Read the session role
    GetRole,
    /// Flash firmware through a port
    Upload {
        /// Port path
        port: String,
        /// Board tag from `UploadOptions`
        board: String,
    },
    /// Boards that can be flashed through a port
    UploadOptions {
        /// Port path
        port: String,
    },
    /// Call a method on the bound printer
    Call {
        /// Method to call
        method: DeviceMethod,
        /// Positional arguments, the role is prepended
        args: Vec<Value>,
        /// Keyword arguments
        kwargs: Map<String, Value>,
    },
    /// Wait for the bound printer to finish moving
    WaitMove,
    /// Wait for the bound printer to reach its temperatures
    WaitTemp,
}

/// Who may make a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Anyone,
    Expert,
    Admin,
}

impl SessionRequest {
    /// Operation name, as used in permission errors
    pub fn name(&self) -> &'static str {
        match self {
            SessionRequest::SetAutodetect(_) => "set_autodetect",
            SessionRequest::GetAutodetect => "get_autodetect",
            SessionRequest::Detect { .. } => "detect",
            SessionRequest::DetectAll => "detect_all",
            SessionRequest::AddPort { .. } => "add_port",
            SessionRequest::RemovePort { .. } => "remove_port",
            SessionRequest::GetPorts => "get_ports",
            SessionRequest::SetDefaultPrinter { .. } => "set_default_printer",
            SessionRequest::GetDefaultPrinter => "get_default_printer",
            SessionRequest::Disable { .. } => "disable",
            SessionRequest::RemovePrinter { .. } => "remove_printer",
            SessionRequest::CreatePrinter => "create_printer",
            SessionRequest::SetPrinter { .. } => "set_printer",
            SessionRequest::GetPrinter => "get_printer",
            SessionRequest::SetMonitor(_) => "set_monitor",
            SessionRequest::GetMonitor => "get_monitor",
            SessionRequest::GetRole => "get_role",
            SessionRequest::Upload { .. } => "upload",
            SessionRequest::UploadOptions { .. } => "upload_options",
            SessionRequest::Call { .. } => "call",
            SessionRequest::WaitMove => "wait_move",
            SessionRequest::WaitTemp => "wait_temp",
        }
    }

    fn access(&self) -> Access {
        match self {
            SessionRequest::Detect { .. }
            | SessionRequest::DetectAll
            | SessionRequest::Disable { .. } => Access::Expert,
            SessionRequest::AddPort { .. }
            | SessionRequest::RemovePort { .. }
            | SessionRequest::RemovePrinter { .. }
            | SessionRequest::Upload { .. } => Access::Admin,
            _ => Access::Anyone,
        }
    }

    /// Whether `role` may make this request
    pub fn allowed_for(&self, role: Role) -> bool {
        match self.access() {
            Access::Anyone => true,
            Access::Expert => role.can_detect(),
            Access::Admin => role.can_administer(),
        }
    }
}

fn options_value(options: &[UploadOption]) -> Value {
    Value::Array(options.iter().map(UploadOption::to_value).collect())
}

impl Coordinator {
    pub(crate) fn handle_request(&mut self, conn: ConnectionId, request: SessionRequest, reply: Reply) {
        let Some(role) = self.connections.get(conn).map(|c| c.role) else {
            debug!("Dropping {} from closed session {}", request.name(), conn);
            return;
        };
        if !request.allowed_for(role) {
            let _ = reply.send(Err(MuxError::PermissionDenied {
                operation: request.name(),
                role,
            }));
            return;
        }

        let result = match request {
            SessionRequest::SetAutodetect(enabled) => {
                self.autodetect = enabled;
                self.broadcast(None, ServerEvent::Autodetect(enabled));
                Ok(Value::Null)
            }
            SessionRequest::GetAutodetect => Ok(Value::Bool(self.autodetect)),
            SessionRequest::Detect { port } => {
                self.detect(&port);
                Ok(Value::Null)
            }
            SessionRequest::DetectAll => {
                for port in self.registry.idle_ports() {
                    self.detect(&port);
                }
                Ok(Value::Null)
            }
            SessionRequest::AddPort { port } => {
                self.add_port(&port);
                Ok(Value::Null)
            }
            SessionRequest::RemovePort { port } => {
                self.remove_port(&port);
                Ok(Value::Null)
            }
            SessionRequest::GetPorts => Ok(json!(self
                .registry
                .ports()
                .map(|(port, _)| port)
                .collect::<Vec<_>>())),
            SessionRequest::SetDefaultPrinter { printer } => {
                self.default_printer = printer;
                Ok(Value::Null)
            }
            SessionRequest::GetDefaultPrinter => Ok(json!(self.default_printer)),
            SessionRequest::Disable { printer, reason } => {
                let reason = reason.as_deref().unwrap_or(DEFAULT_DISABLE_REASON);
                self.disable(printer, reason).map(|()| Value::Null)
            }
            SessionRequest::RemovePrinter { printer } => match self.find_printer(printer) {
                Some(key) => {
                    self.remove_printer(key);
                    Ok(Value::Null)
                }
                None => Err(MuxError::PrinterNotFound(printer)),
            },
            SessionRequest::CreatePrinter => self.create_printer(None).map(|uuid| {
                if let Some(c) = self.connections.get_mut(conn) {
                    c.printer = Some(uuid);
                }
                json!(uuid)
            }),
            SessionRequest::SetPrinter { printer } => {
                let printer = printer.filter(|uuid| self.is_running(*uuid));
                if let Some(c) = self.connections.get_mut(conn) {
                    c.printer = printer;
                }
                Ok(json!(printer))
            }
            SessionRequest::GetPrinter => Ok(json!(self.connections.get(conn).and_then(|c| c.printer))),
            SessionRequest::SetMonitor(enabled) => {
                self.set_monitor(conn, enabled);
                Ok(Value::Null)
            }
            SessionRequest::GetMonitor => {
                Ok(Value::Bool(self.connections.get(conn).is_some_and(|c| c.monitor)))
            }
            SessionRequest::GetRole => Ok(json!(role.as_str())),
            SessionRequest::Upload { port, board } => {
                self.upload(role, port, board, reply);
                return;
            }
            SessionRequest::UploadOptions { port } => {
                Ok(options_value(&upload_options(&port, &self.config.boards)))
            }
            SessionRequest::Call {
                method,
                args,
                kwargs,
            } => {
                self.forward(conn, role, method, args, kwargs, reply);
                return;
            }
            SessionRequest::WaitMove => {
                self.register_wait(conn, WaitTable::Motion, reply);
                return;
            }
            SessionRequest::WaitTemp => {
                self.register_wait(conn, WaitTable::Temperature, reply);
                return;
            }
        };
        let _ = reply.send(result);
    }

    fn set_monitor(&mut self, conn: ConnectionId, enabled: bool) {
        let Some(c) = self.connections.get_mut(conn) else {
            return;
        };
        c.monitor = enabled;
        if !enabled {
            return;
        }
        c.initialized = false;
        let role = c.role;

        if let Some(c) = self.connections.get(conn) {
            c.send(ServerEvent::Autodetect(self.autodetect));
            for (port, state) in self.registry.ports() {
                c.send(ServerEvent::NewPort {
                    port: port.to_string(),
                    options: upload_options(port, &self.config.boards),
                });
                c.send(ServerEvent::port_state(port, state.status()));
            }
        }

        let keys: Vec<_> = self.printers.keys().copied().collect();
        for key in keys {
            self.call(
                key,
                DeviceMethod::SendPrinter,
                vec![json!(role.as_str()), json!(conn)],
                Map::new(),
                Waiter::Ignore,
            );
        }
        if let Some(c) = self.connections.get_mut(conn) {
            c.initialized = true;
        }
    }

    /// Look up the printer a session is bound to
    fn bound_printer(&self, conn: ConnectionId) -> Result<PrinterKey, MuxError> {
        let uuid = self
            .connections
            .get(conn)
            .and_then(|c| c.printer)
            .ok_or(MuxError::NoActivePrinter)?;
        self.find_printer(uuid).ok_or(MuxError::PrinterNotFound(uuid))
    }

    fn forward(
        &mut self,
        conn: ConnectionId,
        role: Role,
        method: DeviceMethod,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        reply: Reply,
    ) {
        if !method.is_forwardable() {
            let _ = reply.send(Err(MuxError::MethodNotAllowed(method)));
            return;
        }
        let key = match self.bound_printer(conn) {
            Ok(key) => key,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(json!(role.as_str()));
        full.extend(args);
        self.call(key, method, full, kwargs, Waiter::Session(reply));
    }

    fn register_wait(&mut self, conn: ConnectionId, table: WaitTable, reply: Reply) {
        let key = match self.bound_printer(conn) {
            Ok(key) => key,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if let Some(printer) = self.printers.get_mut(&key) {
            let id = printer.wait(table, Waiter::Session(reply));
            debug!("{} waits for {:?} as {}", printer.label(), table, id);
        }
    }

    fn upload(&mut self, role: Role, port: String, board: String, reply: Reply) {
        if !self.registry.contains(&port) {
            let _ = reply.send(Err(MuxError::UnknownPort(port)));
            return;
        }
        let Some(recipe) = resolve_board(&port, &board, &self.config.boards) else {
            let _ = reply.send(Err(MuxError::UnsupportedBoard(board)));
            return;
        };
        info!("{} session uploads {} firmware to {}", role, board, port);

        if let Some(key) = self.registry.bound_to(&port) {
            self.disable_key(key, "disabled for upload");
        }
        self.cancel_busy(&port);

        let request = FlashRequest {
            port: port.clone(),
            board: board.clone(),
            recipe,
        };
        let attempt = self.registry.next_attempt();
        let flash = self.backend.flasher.flash(request);
        let tasks = self.tasks.clone();
        let task_port = port.clone();
        let task = tokio::spawn(async move {
            let result = flash.await;
            let _ = tasks.send(TaskEvent::Flash {
                port: task_port,
                attempt,
                result,
            });
        });
        self.registry.set_busy(
            &port,
            BusyHandle::new(BusyKind::Flashing, attempt, task.abort_handle()),
        );
        self.announce(&port, PortStatus::Flashing);
        self.uploads.insert(
            port,
            PendingUpload {
                attempt,
                board,
                reply,
            },
        );
    }

    pub(crate) fn flash_done(&mut self, port: String, attempt: u64, result: Result<(), String>) {
        if self.registry.clear_busy(&port, attempt).is_none() {
            debug!("Discarding stale upload result for {}", port);
            return;
        }
        match &result {
            Ok(()) => info!("Firmware upload to {} done", port),
            Err(output) => info!("Firmware upload to {} reported: {}", port, output.trim()),
        }
        self.announce(&port, PortStatus::Idle);
        if self.autodetect {
            self.defer_detect(&port);
        }
        match self.uploads.remove(&port) {
            Some(upload) if upload.attempt == attempt => {
                let _ = upload
                    .reply
                    .send(Ok(Value::String(upload_reply(&upload.board, &result))));
            }
            Some(upload) => {
                debug!("Upload on {} belongs to attempt {}", port, upload.attempt);
                self.uploads.insert(port, upload);
            }
            None => {}
        }
    }
}
