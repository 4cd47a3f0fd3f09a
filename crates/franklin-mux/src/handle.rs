//! Handles onto a running coordinator

use franklin_protocol::{DeviceId, DeviceMethod};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::config::CoordinatorConfig;
use crate::connection::{ConnectionId, Role};
use crate::coordinator::{run_coordinator, CoordinatorCommand, CoordinatorStatus};
use crate::error::MuxError;
use crate::events::ServerEvent;
use crate::router::SessionRequest;

/// Spawn a coordinator task
pub fn spawn_coordinator(config: CoordinatorConfig, backend: Backend) -> (CoordinatorHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_coordinator(config, backend, cmd_rx));
    (CoordinatorHandle::new(cmd_tx), task)
}

/// Cloneable sender of coordinator commands
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    /// Wrap the command sender of a coordinator started with
    /// [`run_coordinator`]
    pub fn new(commands: mpsc::UnboundedSender<CoordinatorCommand>) -> Self {
        Self { commands }
    }

    fn send(&self, cmd: CoordinatorCommand) -> Result<(), MuxError> {
        self.commands.send(cmd).map_err(|_| MuxError::CoordinatorGone)
    }

    /// Register a port
    pub fn add_port(&self, port: impl Into<String>) -> Result<(), MuxError> {
        self.send(CoordinatorCommand::AddPort(port.into()))
    }

    /// Forget a port
    pub fn remove_port(&self, port: impl Into<String>) -> Result<(), MuxError> {
        self.send(CoordinatorCommand::RemovePort(port.into()))
    }

    /// Run detection on a port
    pub fn detect(&self, port: impl Into<String>) -> Result<(), MuxError> {
        self.send(CoordinatorCommand::Detect(port.into()))
    }

    /// Start a detached worker for `uuid`, or for a fresh identity
    pub async fn create_printer(&self, uuid: Option<DeviceId>) -> Result<DeviceId, MuxError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorCommand::CreatePrinter { uuid, response: tx })?;
        rx.await.map_err(|_| MuxError::CoordinatorGone)?
    }

    /// Snapshot of ports and printers
    pub async fn status(&self) -> Result<CoordinatorStatus, MuxError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorCommand::Status(tx))?;
        rx.await.map_err(|_| MuxError::CoordinatorGone)
    }

    /// Open a session with the given role
    pub async fn open_session(&self, role: Role) -> Result<Session, MuxError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorCommand::OpenSession {
            role,
            events: events_tx,
            response: tx,
        })?;
        let id = rx.await.map_err(|_| MuxError::CoordinatorGone)?;
        Ok(Session {
            id,
            role,
            handle: self.clone(),
            events,
        })
    }

    /// Stop the coordinator
    pub fn shutdown(&self) {
        let _ = self.send(CoordinatorCommand::Shutdown);
    }

    /// Resolves once the coordinator has stopped
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

/// A client session. Dropping it closes the session.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    role: Role,
    handle: CoordinatorHandle,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, MuxError> {
    serde_json::from_value(value).map_err(|e| MuxError::InvalidReply(e.to_string()))
}

impl Session {
    /// Connection id, the target of broadcasts meant for this session
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Access level
    pub fn role(&self) -> Role {
        self.role
    }

    /// Make a request and wait for its reply
    pub async fn request(&self, request: SessionRequest) -> Result<Value, MuxError> {
        let (tx, rx) = oneshot::channel();
        self.handle.send(CoordinatorCommand::Request {
            conn: self.id,
            request,
            reply: tx,
        })?;
        rx.await.map_err(|_| MuxError::CoordinatorGone)?
    }

    /// Next event delivered while monitoring; `None` once the coordinator
    /// is gone
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Next event if one is queued
    pub fn try_next_event(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }

    /// Start or stop receiving events; starting replays the current state
    pub async fn set_monitor(&self, enabled: bool) -> Result<(), MuxError> {
        self.request(SessionRequest::SetMonitor(enabled)).await.map(drop)
    }

    /// Turn automatic detection on or off for every session
    pub async fn set_autodetect(&self, enabled: bool) -> Result<(), MuxError> {
        self.request(SessionRequest::SetAutodetect(enabled)).await.map(drop)
    }

    /// Detect the device on `port`, dropping whatever holds it now
    pub async fn detect(&self, port: impl Into<String>) -> Result<(), MuxError> {
        self.request(SessionRequest::Detect { port: port.into() })
            .await
            .map(drop)
    }

    /// Known ports, sorted
    pub async fn get_ports(&self) -> Result<Vec<String>, MuxError> {
        decode(self.request(SessionRequest::GetPorts).await?)
    }

    /// Detach a printer from its port; `None` uses the default reason
    pub async fn disable(&self, printer: DeviceId, reason: Option<&str>) -> Result<(), MuxError> {
        self.request(SessionRequest::Disable {
            printer,
            reason: reason.map(str::to_string),
        })
        .await
        .map(drop)
    }

    /// Stop a printer's worker and forget it
    pub async fn remove_printer(&self, printer: DeviceId) -> Result<(), MuxError> {
        self.request(SessionRequest::RemovePrinter { printer })
            .await
            .map(drop)
    }

    /// Start a detached printer and bind this session to it
    pub async fn create_printer(&self) -> Result<DeviceId, MuxError> {
        decode(self.request(SessionRequest::CreatePrinter).await?)
    }

    /// Bind to a printer; returns the printer actually bound
    pub async fn set_printer(&self, printer: Option<DeviceId>) -> Result<Option<DeviceId>, MuxError> {
        decode(self.request(SessionRequest::SetPrinter { printer }).await?)
    }

    /// Printer this session is bound to
    pub async fn get_printer(&self) -> Result<Option<DeviceId>, MuxError> {
        decode(self.request(SessionRequest::GetPrinter).await?)
    }

    /// Flash firmware; resolves with the upload report once flashing ends
    pub async fn upload(&self, port: impl Into<String>, board: impl Into<String>) -> Result<String, MuxError> {
        decode(
            self.request(SessionRequest::Upload {
                port: port.into(),
                board: board.into(),
            })
            .await?,
        )
    }

    /// Call a method on the bound printer
    pub async fn call(&self, method: DeviceMethod, args: Vec<Value>) -> Result<Value, MuxError> {
        self.request(SessionRequest::Call {
            method,
            args,
            kwargs: Map::new(),
        })
        .await
    }

    /// Resolves when the bound printer finishes its queued moves
    pub async fn wait_move(&self) -> Result<Value, MuxError> {
        self.request(SessionRequest::WaitMove).await
    }

    /// Resolves when the bound printer reaches its target temperature
    pub async fn wait_temp(&self) -> Result<Value, MuxError> {
        self.request(SessionRequest::WaitTemp).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.handle.send(CoordinatorCommand::CloseSession(self.id));
    }
}
