//! Events pushed to monitoring sessions
//!
//! Every change observers care about (ports appearing, port state changes,
//! printers going away, anything a worker chooses to broadcast) is emitted
//! as a [`ServerEvent`]. The wire form is an event name plus a list of JSON
//! arguments, see [`ServerEvent::name`] and [`ServerEvent::args`].

use franklin_protocol::DeviceId;
use serde_json::Value;

use crate::firmware::UploadOption;

/// Port state codes as announced in `port_state` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PortStatus {
    /// No printer, nothing running
    Idle = 0,
    /// Identify handshake running
    Detecting = 1,
    /// A printer is attached
    Connected = 2,
    /// Firmware upload running
    Flashing = 3,
}

impl PortStatus {
    /// Numeric code
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Event delivered to monitoring sessions
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The autodetect flag changed (or is being replayed)
    Autodetect(bool),

    /// A port was added
    NewPort {
        /// Port path
        port: String,
        /// Firmware boards that can be flashed through it
        options: Vec<UploadOption>,
    },

    /// A port was removed
    DelPort {
        /// Port path
        port: String,
    },

    /// A port changed state
    PortState {
        /// Port path
        port: String,
        /// New state
        state: PortStatus,
    },

    /// A printer was removed
    DelPrinter {
        /// Identity of the removed printer
        uuid: DeviceId,
    },

    /// Event originated by a worker
    Device {
        /// Event name chosen by the worker
        name: String,
        /// Identity of the originating printer, if known yet
        uuid: Option<DeviceId>,
        /// Event arguments
        args: Vec<Value>,
    },
}

impl ServerEvent {
    /// Event name on the wire
    pub fn name(&self) -> &str {
        match self {
            ServerEvent::Autodetect(_) => "autodetect",
            ServerEvent::NewPort { .. } => "new_port",
            ServerEvent::DelPort { .. } => "del_port",
            ServerEvent::PortState { .. } => "port_state",
            ServerEvent::DelPrinter { .. } => "del_printer",
            ServerEvent::Device { name, .. } => name,
        }
    }

    /// Event arguments on the wire
    pub fn args(&self) -> Vec<Value> {
        match self {
            ServerEvent::Autodetect(enabled) => vec![Value::Bool(*enabled)],
            ServerEvent::NewPort { port, options } => vec![
                Value::String(port.clone()),
                Value::Array(options.iter().map(UploadOption::to_value).collect()),
            ],
            ServerEvent::DelPort { port } => vec![Value::String(port.clone())],
            ServerEvent::PortState { port, state } => {
                vec![Value::String(port.clone()), Value::from(state.code())]
            }
            ServerEvent::DelPrinter { uuid } => vec![Value::String(uuid.to_string())],
            ServerEvent::Device { uuid, args, .. } => {
                let mut out = Vec::with_capacity(args.len() + 1);
                out.push(uuid.map_or(Value::Null, |u| Value::String(u.to_string())));
                out.extend(args.iter().cloned());
                out
            }
        }
    }

    /// Shorthand for a `port_state` event
    pub fn port_state(port: &str, state: PortStatus) -> Self {
        ServerEvent::PortState {
            port: port.to_string(),
            state,
        }
    }
}
