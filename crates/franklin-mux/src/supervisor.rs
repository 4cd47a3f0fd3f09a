//! Worker records and printer lifecycle
//!
//! Records from a worker are decoded in arrival order and either resolve a
//! waiter, fan out as a broadcast, or release the port. Internal waiters
//! carry a [`Continuation`] that is run here once the reply is in.

use franklin_protocol::{DeviceId, DeviceMethod, WorkerMessage};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::MuxError;
use crate::events::{PortStatus, ServerEvent};
use crate::printer::{Continuation, WaitTable, Waiter, WorkerEvent};
use crate::registry::PrinterKey;

/// What happens to the port of a printer that died
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortFate {
    /// The port is assumed gone and leaves the registry
    Remove,
    /// The port stays and becomes idle
    Release,
}

impl Coordinator {
    pub(crate) fn handle_worker_event(&mut self, key: PrinterKey, event: WorkerEvent) {
        match event {
            WorkerEvent::Output(data) => self.worker_output(key, &data),
            WorkerEvent::Closed(reason) => {
                self.worker_died(key, &reason, PortFate::Remove);
            }
            WorkerEvent::WriteFailed(reason) => {
                self.worker_died(key, &format!("from write error: {reason}"), PortFate::Remove);
            }
        }
    }

    fn worker_output(&mut self, key: PrinterKey, data: &[u8]) {
        match self.printers.get_mut(&key) {
            Some(printer) => printer.input.push_bytes(data),
            None => return,
        }

        loop {
            // a record may have killed the printer
            let Some(printer) = self.printers.get_mut(&key) else {
                return;
            };
            let Some(line) = printer.input.next_line() else {
                return;
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match WorkerMessage::parse(&line) {
                Ok(message) => self.worker_message(key, message),
                Err(e) => {
                    warn!(
                        "Invalid record from {}: {} ({:?})",
                        printer.label(),
                        e,
                        String::from_utf8_lossy(&line)
                    );
                    self.worker_died(key, "because it sent an invalid record", PortFate::Remove);
                    return;
                }
            }
        }
    }

    fn worker_message(&mut self, key: PrinterKey, message: WorkerMessage) {
        match message {
            WorkerMessage::Result { id, value } => {
                self.resolve_reply(key, WaitTable::Generic, id, Ok(value))
            }
            WorkerMessage::Error {
                id: Some(id),
                message,
            } => self.resolve_reply(key, WaitTable::Generic, id, Err(MuxError::CallFailed(message))),
            WorkerMessage::Error { id: None, message } => {
                warn!("Error without call from printer {}: {}", key, message)
            }
            WorkerMessage::MoveCb { id, value } => {
                self.resolve_reply(key, WaitTable::Motion, id, Ok(value))
            }
            WorkerMessage::TempCb { id, value } => {
                self.resolve_reply(key, WaitTable::Temperature, id, Ok(value))
            }
            WorkerMessage::Broadcast { target, name, args } => {
                let uuid = self.printers.get(&key).and_then(|p| p.uuid);
                self.broadcast(target, ServerEvent::Device { name, uuid, args });
            }
            WorkerMessage::Disconnect => self.worker_disconnected(key),
        }
    }

    fn resolve_reply(
        &mut self,
        key: PrinterKey,
        table: WaitTable,
        id: u64,
        result: Result<Value, MuxError>,
    ) {
        let Some(printer) = self.printers.get_mut(&key) else {
            return;
        };
        match printer.waiters.take(table, id) {
            Some(waiter) => self.resolve(key, waiter, result),
            None => warn!(
                "Printer {} answered unknown {:?} call {}",
                printer.label(),
                table,
                id
            ),
        }
    }

    /// The worker let go of its port on its own
    fn worker_disconnected(&mut self, key: PrinterKey) {
        let Some(printer) = self.printers.get_mut(&key) else {
            return;
        };
        let Some(port) = printer.port.take() else {
            debug!("Disconnect from {} which has no port", printer.label());
            return;
        };
        info!("Printer {} disconnected from {}", printer.label(), port);
        if self.registry.release(&port, key) {
            self.announce(&port, PortStatus::Idle);
        }
        if self.autodetect {
            self.defer_detect(&port);
        }
    }

    /// Tear a printer down after its worker became unreachable. Every
    /// waiter fails with the returned message.
    pub(crate) fn worker_died(
        &mut self,
        key: PrinterKey,
        reason: &str,
        fate: PortFate,
    ) -> Option<String> {
        let mut printer = self.printers.remove(&key)?;
        let message = format!("Printer {} died {}", printer.label(), reason);
        warn!("{}", message);
        printer.kill();

        for waiter in printer.waiters.drain() {
            self.resolve(key, waiter, Err(MuxError::PrinterDied(message.clone())));
        }

        if let Some(port) = printer.port.take() {
            if self.registry.bound_to(&port) == Some(key) {
                match fate {
                    PortFate::Remove => {
                        self.registry.remove(&port);
                        self.broadcast(None, ServerEvent::DelPort { port });
                    }
                    PortFate::Release => {
                        self.registry.release(&port, key);
                        self.announce(&port, PortStatus::Idle);
                    }
                }
            }
        }
        Some(message)
    }

    /// Give up the port of a printer after a failed handshake step
    fn abandon_port(&mut self, key: PrinterKey, port: &str) {
        let Some(printer) = self.printers.get_mut(&key) else {
            return;
        };
        printer.close_detect_link();
        if printer.port.as_deref() == Some(port) {
            printer.port = None;
        }
        if self.registry.release(port, key) {
            self.announce(port, PortStatus::Idle);
        }
    }

    pub(crate) fn remove_printer(&mut self, key: PrinterKey) {
        let Some(printer) = self.printers.get(&key) else {
            return;
        };
        info!("Removing printer {}", printer.label());
        if printer.port.is_some() {
            self.admin_call(
                key,
                DeviceMethod::Disconnect,
                Vec::new(),
                Waiter::Internal(Continuation::RemoveDisconnected),
            );
        } else {
            self.send_die(key);
        }
    }

    fn send_die(&mut self, key: PrinterKey) {
        self.admin_call(
            key,
            DeviceMethod::Die,
            vec![json!("Printer is removed")],
            Waiter::Internal(Continuation::RemoveDied),
        );
    }

    pub(crate) fn continue_with(
        &mut self,
        key: PrinterKey,
        continuation: Continuation,
        result: Result<Value, MuxError>,
    ) {
        match continuation {
            Continuation::GotGlobals { port } => self.got_globals(key, port, result),
            Continuation::SentPrinter { port } => match result {
                Ok(_) => {
                    if let Some(port) = port {
                        if self.registry.bound_to(&port) == Some(key) {
                            self.announce(&port, PortStatus::Connected);
                        }
                    }
                }
                Err(e) => debug!("send_printer of printer {} failed: {}", key, e),
            },
            Continuation::UuidMinted { port, run_id } => {
                let minted = match result {
                    Ok(value) => value.as_str().and_then(DeviceId::parse),
                    Err(e) => {
                        warn!("Failed to assign an identity to printer {}: {}", key, e);
                        None
                    }
                };
                let Some(uuid) = minted else {
                    self.abandon_port(key, &port);
                    return;
                };
                if let Some(printer) = self.printers.get_mut(&key) {
                    if settle_identity(&mut printer.uuid, uuid) {
                        info!("Printer {} on {} is now {}", key, port, uuid);
                    } else {
                        warn!("Printer {} was assigned {}; keeping {}", key, uuid, printer.label());
                    }
                }
                if self.registry.bound_to(&port) == Some(key) {
                    self.connect(key, &port, run_id, false);
                }
            }
            Continuation::ConnectDone { port, announce } => match result {
                Ok(_) => {
                    if let Some(printer) = self.printers.get_mut(&key) {
                        printer.close_detect_link();
                    }
                    if announce && self.registry.bound_to(&port) == Some(key) {
                        self.announce(&port, PortStatus::Connected);
                    }
                }
                Err(e) => {
                    warn!("Printer {} failed to connect to {}: {}", key, port, e);
                    self.abandon_port(key, &port);
                }
            },
            Continuation::ReconnectDone { port } => match result {
                Ok(_) => self.admin_call(
                    key,
                    DeviceMethod::SendPrinter,
                    vec![Value::Null],
                    Waiter::Internal(Continuation::CloseDetectLink),
                ),
                Err(e) => {
                    warn!("Printer {} failed to reconnect to {}: {}", key, port, e);
                    if let Some(printer) = self.printers.get_mut(&key) {
                        printer.close_detect_link();
                    }
                }
            },
            Continuation::CloseDetectLink => {
                if let Some(printer) = self.printers.get_mut(&key) {
                    printer.close_detect_link();
                }
            }
            Continuation::RemoveDisconnected => {
                if let Some(printer) = self.printers.get_mut(&key) {
                    if let Some(port) = printer.port.take() {
                        if self.registry.release(&port, key) {
                            self.announce(&port, PortStatus::Idle);
                        }
                    }
                }
                self.send_die(key);
            }
            Continuation::RemoveDied => {
                let Some(mut printer) = self.printers.remove(&key) else {
                    return;
                };
                if let Err(e) = result {
                    debug!("die of {} failed: {}", printer.label(), e);
                }
                printer.kill();
                if let Some(uuid) = printer.uuid {
                    self.broadcast(None, ServerEvent::DelPrinter { uuid });
                }
                let message = format!("Printer {} died because it was removed", printer.label());
                for waiter in printer.waiters.drain() {
                    self.resolve(key, waiter, Err(MuxError::PrinterDied(message.clone())));
                }
                info!("Removed printer {}", printer.label());
            }
        }
    }

    fn got_globals(
        &mut self,
        key: PrinterKey,
        port: Option<String>,
        result: Result<Value, MuxError>,
    ) {
        let Some(printer) = self.printers.get_mut(&key) else {
            return;
        };
        // the worker owns the port now
        printer.close_detect_link();

        let vars = match result {
            Ok(vars) => vars,
            Err(e) => {
                warn!("Failed to get globals of {}: {}", printer.label(), e);
                return;
            }
        };
        let reported = vars.get("uuid").and_then(Value::as_str).and_then(DeviceId::parse);
        if let Some(uuid) = reported {
            if !settle_identity(&mut printer.uuid, uuid) {
                warn!("Printer {} reports identity {}; keeping {}", key, uuid, printer.label())
            }
        }
        if let Some(name) = vars.get("name").and_then(Value::as_str) {
            printer.name = Some(name.to_string());
        }

        self.admin_call(
            key,
            DeviceMethod::SendPrinter,
            vec![Value::Null],
            Waiter::Internal(Continuation::SentPrinter { port }),
        );
    }
}

/// Record `reported` as the identity of a printer that has none yet.
/// Returns `false` when a different identity is already set.
fn settle_identity(current: &mut Option<DeviceId>, reported: DeviceId) -> bool {
    match current {
        None => {
            *current = Some(reported);
            true
        }
        Some(own) => *own == reported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_set_once() {
        let first = DeviceId::generate();
        let mut uuid = None;
        assert!(settle_identity(&mut uuid, first));
        assert!(settle_identity(&mut uuid, first));

        assert!(!settle_identity(&mut uuid, DeviceId::generate()));
        assert_eq!(uuid, Some(first));
    }
}
