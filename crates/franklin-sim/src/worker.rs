//! Virtual worker process
//!
//! Speaks the worker side of the line protocol: reads call records,
//! answers lifecycle methods the way a real driver does and echoes
//! everything else back as its result. Tests steer it through
//! [`WorkerControl`] messages, for example to make it crash or to hold
//! back the reply to a method.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use franklin_detect::is_synthetic_port;
use franklin_mux::WorkerArgs;
use franklin_protocol::{DeviceId, RunId};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::backend::DeviceTable;

/// A call as received by a virtual worker
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Call id
    pub id: u64,
    /// Method name
    pub method: String,
    /// Positional arguments, role first
    pub args: Vec<Value>,
}

/// Instructions for a running virtual worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerControl {
    /// Write a raw line (newline is added)
    Emit(String),
    /// Release the port and report it with a `disconnect` record
    Disconnect,
    /// Broadcast an event to every session or one target
    Broadcast {
        /// Target connection, `None` for all
        target: Option<u64>,
        /// Event name
        name: String,
        /// Event arguments
        args: Vec<Value>,
    },
    /// Stop answering calls to this method
    Hold(String),
    /// Exit without a word, closing both pipes
    Crash,
}

/// What a worker writes in response to one input
#[derive(Debug, Default)]
pub struct WorkerOutput {
    /// Records to write, one per line
    pub records: Vec<Value>,
    /// Exit after writing them
    pub exit: bool,
}

/// State of a simulated worker
#[derive(Debug)]
pub struct VirtualWorker {
    uuid: Option<DeviceId>,
    name: String,
    port: Option<String>,
    held: HashSet<String>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    devices: DeviceTable,
}

fn parse_run_id(value: Option<&Value>) -> Option<RunId> {
    let chars = value?.as_array()?;
    let mut bytes = [0u8; 8];
    if chars.len() != bytes.len() {
        return None;
    }
    for (byte, c) in bytes.iter_mut().zip(chars) {
        let code = c.as_str()?.chars().next()? as u32;
        *byte = u8::try_from(code).ok()?;
    }
    Some(RunId::new(bytes))
}

impl VirtualWorker {
    /// A worker started with `args`; ports' identities and run-ids are
    /// kept in `devices`
    pub fn new(args: &WorkerArgs, devices: DeviceTable) -> Self {
        let uuid = match (&args.uuid, &args.port) {
            (Some(uuid), _) => Some(*uuid),
            (None, Some(port)) if is_synthetic_port(port) => Some(DeviceId::generate()),
            (None, _) => None,
        };
        Self {
            uuid,
            name: String::new(),
            port: args.port.clone(),
            held: HashSet::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
            devices,
        }
    }

    /// Set the name reported by `get_globals`
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Shared log of received calls
    pub fn calls(&self) -> Arc<Mutex<Vec<RecordedCall>>> {
        self.calls.clone()
    }

    fn globals(&self) -> Value {
        json!({
            "uuid": self.uuid.map(|u| u.to_string()),
            "name": self.name,
            "port": self.port,
        })
    }

    /// Answer one call line
    pub fn handle_line(&mut self, line: &[u8]) -> WorkerOutput {
        let mut out = WorkerOutput::default();
        let Ok(Value::Array(fields)) = serde_json::from_slice::<Value>(line) else {
            out.records.push(json!([null, "error", "malformed call"]));
            return out;
        };
        let (Some(id), Some(method)) = (
            fields.first().and_then(Value::as_u64),
            fields.get(1).and_then(Value::as_str),
        ) else {
            out.records.push(json!([null, "error", "malformed call"]));
            return out;
        };
        let args = fields
            .get(2)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        trace!("Virtual worker got {} #{}", method, id);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                id,
                method: method.to_string(),
                args: args.clone(),
            });
        if self.held.contains(method) {
            return out;
        }

        let result = match method {
            "get_globals" => self.globals(),
            "send_printer" => {
                let target = args.get(1).and_then(Value::as_u64);
                out.records
                    .push(json!([null, "broadcast", target, "new_printer", self.globals()]));
                Value::Null
            }
            "connect" => {
                self.port = args.get(1).and_then(Value::as_str).map(str::to_string);
                if let (Some(port), Some(run_id)) = (&self.port, parse_run_id(args.get(2))) {
                    self.devices.update(port, |device| device.set_run_id(run_id));
                }
                Value::Null
            }
            "reconnect" => {
                self.port = args.get(1).and_then(Value::as_str).map(str::to_string);
                Value::Null
            }
            "disconnect" => {
                self.port = None;
                Value::Null
            }
            "reset_uuid" => {
                let uuid = DeviceId::generate();
                self.uuid = Some(uuid);
                if let Some(port) = &self.port {
                    self.devices.update(port, |device| device.set_identity(uuid));
                }
                json!(uuid.to_string())
            }
            "die" => {
                out.exit = true;
                Value::Null
            }
            _ => json!({ "method": method, "args": args }),
        };
        out.records.push(json!([id, "result", result]));
        out
    }

    /// Apply a control message
    pub fn control(&mut self, control: WorkerControl) -> WorkerOutput {
        let mut out = WorkerOutput::default();
        match control {
            WorkerControl::Emit(line) => match serde_json::from_str(&line) {
                Ok(value) => out.records.push(value),
                // deliberately broken lines are passed through as strings
                Err(_) => out.records.push(Value::String(line)),
            },
            WorkerControl::Disconnect => {
                self.port = None;
                out.records.push(json!([null, "disconnect"]));
            }
            WorkerControl::Broadcast { target, name, args } => {
                let mut record = vec![Value::Null, json!("broadcast"), json!(target), json!(name)];
                record.extend(args);
                out.records.push(Value::Array(record));
            }
            WorkerControl::Hold(method) => {
                self.held.insert(method);
            }
            WorkerControl::Crash => out.exit = true,
        }
        out
    }
}

fn encode(record: &Value) -> Vec<u8> {
    let mut line = match record {
        Value::String(raw) => raw.clone().into_bytes(),
        other => other.to_string().into_bytes(),
    };
    line.push(b'\n');
    line
}

async fn write_output<W: AsyncWrite + Unpin>(writer: &mut W, output: &WorkerOutput) -> io::Result<()> {
    for record in &output.records {
        writer.write_all(&encode(record)).await?;
    }
    writer.flush().await
}

/// Serve `worker` over `stream` until it exits or the host hangs up
pub async fn run_virtual_worker<S>(
    stream: S,
    mut worker: VirtualWorker,
    mut control: mpsc::UnboundedReceiver<WorkerControl>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            biased;
            cmd = control.recv() => {
                let Some(cmd) = cmd else {
                    return Ok(());
                };
                let output = worker.control(cmd);
                write_output(&mut writer, &output).await?;
                if output.exit {
                    debug!("Virtual worker exiting on request");
                    return Ok(());
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Virtual worker input closed");
                    return Ok(());
                };
                let output = worker.handle_line(line.as_bytes());
                write_output(&mut writer, &output).await?;
                if output.exit {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(uuid: Option<DeviceId>, port: Option<&str>) -> VirtualWorker {
        let args = WorkerArgs {
            uuid,
            port: port.map(str::to_string),
            allow_system: String::new(),
        };
        VirtualWorker::new(&args, DeviceTable::default())
    }

    #[test]
    fn test_synthetic_port_mints_identity() {
        assert!(worker(None, Some("-sim0")).uuid.is_some());
        assert!(worker(None, Some("/dev/ttyUSB0")).uuid.is_none());
    }

    #[test]
    fn test_get_globals_reports_identity() {
        let uuid = DeviceId::generate();
        let mut w = worker(Some(uuid), None).with_name("bench");
        let out = w.handle_line(br#"[0,"get_globals",["admin"],{}]"#);
        assert_eq!(
            out.records,
            vec![json!([0, "result", {"uuid": uuid.to_string(), "name": "bench", "port": null}])]
        );
    }

    #[test]
    fn test_send_printer_broadcasts_first() {
        let mut w = worker(Some(DeviceId::generate()), None);
        let out = w.handle_line(br#"[3,"send_printer",["user",7],{}]"#);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0][1], json!("broadcast"));
        assert_eq!(out.records[0][2], json!(7));
        assert_eq!(out.records[1], json!([3, "result", null]));
    }

    #[test]
    fn test_held_method_is_recorded_not_answered() {
        let mut w = worker(Some(DeviceId::generate()), None);
        w.control(WorkerControl::Hold("home".into()));
        let out = w.handle_line(br#"[1,"home",["user"],{}]"#);
        assert!(out.records.is_empty());
        assert_eq!(w.calls.lock().unwrap()[0].method, "home");
    }

    #[test]
    fn test_run_id_chars() {
        let chars = json!(["@", "\u{e1}", "@", "@", "@", "@", "@", "\u{ff}"]);
        let run_id = parse_run_id(Some(&chars)).unwrap();
        assert_eq!(run_id.as_bytes(), &[0x40, 0xe1, 0x40, 0x40, 0x40, 0x40, 0x40, 0xff]);
    }
}
