//! Worker supervision
//!
//! Each printer owns one worker process. Calls go out as JSON lines on the
//! worker's stdin through a writer task; a reader task forwards stdout
//! chunks to the coordinator, which splits them into records in arrival
//! order. Replies are matched to waiters by call-id.

use std::collections::BTreeMap;

use franklin_protocol::{CallId, DeviceId, DeviceMethod, LineBuffer, Request, RunId};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::backend::{BoxedLink, WorkerProcess};
use crate::coordinator::TaskEvent;
use crate::error::MuxError;
use crate::registry::PrinterKey;

/// Reply channel of a session request
pub type Reply = oneshot::Sender<Result<Value, MuxError>>;

/// The three waiter tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTable {
    /// Replies to calls (`result` / `error`)
    Generic,
    /// Motion completion (`movecb`)
    Motion,
    /// Temperature completion (`tempcb`)
    Temperature,
}

/// Pending waiters of one printer, keyed by call-id.
///
/// All three tables share one counter, so an id is only ever issued once.
#[derive(Debug)]
pub struct WaiterTables<W> {
    next_id: CallId,
    generic: BTreeMap<CallId, W>,
    motion: BTreeMap<CallId, W>,
    temperature: BTreeMap<CallId, W>,
}

impl<W> Default for WaiterTables<W> {
    fn default() -> Self {
        Self {
            next_id: 0,
            generic: BTreeMap::new(),
            motion: BTreeMap::new(),
            temperature: BTreeMap::new(),
        }
    }
}

impl<W> WaiterTables<W> {
    /// Create empty tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next call-id without registering anything
    pub fn next_id(&mut self) -> CallId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a waiter under an id from [`next_id`](Self::next_id)
    pub fn insert(&mut self, table: WaitTable, id: CallId, waiter: W) {
        let previous = self.table_mut(table).insert(id, waiter);
        assert!(previous.is_none(), "call-id {id} registered twice");
    }

    /// Issue an id and register `waiter` under it
    pub fn issue(&mut self, table: WaitTable, waiter: W) -> CallId {
        let id = self.next_id();
        self.insert(table, id, waiter);
        id
    }

    /// Remove and return the waiter for `id`
    pub fn take(&mut self, table: WaitTable, id: CallId) -> Option<W> {
        self.table_mut(table).remove(&id)
    }

    /// Remove every waiter, generic table first
    pub fn drain(&mut self) -> Vec<W> {
        let mut all = Vec::with_capacity(self.len());
        for table in [&mut self.generic, &mut self.motion, &mut self.temperature] {
            all.extend(std::mem::take(table).into_values());
        }
        all
    }

    /// Number of outstanding waiters
    pub fn len(&self) -> usize {
        self.generic.len() + self.motion.len() + self.temperature.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tables currently holding `id`
    pub fn tables_holding(&self, id: CallId) -> usize {
        [&self.generic, &self.motion, &self.temperature]
            .iter()
            .filter(|t| t.contains_key(&id))
            .count()
    }

    fn table_mut(&mut self, table: WaitTable) -> &mut BTreeMap<CallId, W> {
        match table {
            WaitTable::Generic => &mut self.generic,
            WaitTable::Motion => &mut self.motion,
            WaitTable::Temperature => &mut self.temperature,
        }
    }
}

/// Follow-up work of an internal call, run when its reply arrives
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Continuation {
    /// `get_globals` answered; `port` is the port the printer was started on
    GotGlobals { port: Option<String> },
    /// `send_printer` answered after startup
    SentPrinter { port: Option<String> },
    /// `reset_uuid` answered with a fresh identity
    UuidMinted { port: String, run_id: RunId },
    /// `connect` answered; returning devices announce on success
    ConnectDone { port: String, announce: bool },
    /// `reconnect` answered on a live reconnect
    ReconnectDone { port: String },
    /// `send_printer` after a reconnect; the detection link can go
    CloseDetectLink,
    /// `disconnect` answered during removal
    RemoveDisconnected,
    /// `die` answered during removal
    RemoveDied,
}

/// Whoever is waiting for a reply
#[derive(Debug)]
pub(crate) enum Waiter {
    /// A session request
    Session(Reply),
    /// The coordinator itself
    Internal(Continuation),
    /// Nobody; the reply is dropped
    Ignore,
}

/// Output of a worker's I/O tasks
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// A chunk of stdout
    Output(Vec<u8>),
    /// Stdout ended or failed
    Closed(String),
    /// Writing to stdin failed
    WriteFailed(String),
}

/// A running worker and everything pending on it
pub(crate) struct Printer {
    pub key: PrinterKey,
    pub uuid: Option<DeviceId>,
    pub name: Option<String>,
    pub port: Option<String>,
    pub run_id: Option<RunId>,
    pub waiters: WaiterTables<Waiter>,
    pub input: LineBuffer,
    pub detect_link: Option<BoxedLink>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    tasks: [JoinHandle<()>; 2],
    child: Option<Child>,
}

impl Printer {
    /// Take over a started worker and spawn its I/O tasks
    pub fn start(
        key: PrinterKey,
        process: WorkerProcess,
        port: Option<String>,
        run_id: Option<RunId>,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        let WorkerProcess {
            mut stdin,
            mut stdout,
            child,
        } = process;

        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => {
                        let _ = reader_events.send(TaskEvent::Worker(
                            key,
                            WorkerEvent::Closed("because its output closed".into()),
                        ));
                        break;
                    }
                    Ok(n) => {
                        if reader_events
                            .send(TaskEvent::Worker(key, WorkerEvent::Output(buf[..n].to_vec())))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = reader_events.send(TaskEvent::Worker(
                            key,
                            WorkerEvent::Closed(format!("from error: {e}")),
                        ));
                        break;
                    }
                }
            }
        });

        let (writer, mut lines) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                let written = async {
                    stdin.write_all(&line).await?;
                    stdin.flush().await
                };
                if let Err(e) = written.await {
                    let _ = events.send(TaskEvent::Worker(key, WorkerEvent::WriteFailed(e.to_string())));
                    break;
                }
            }
        });

        Self {
            key,
            uuid: None,
            name: None,
            port,
            run_id,
            waiters: WaiterTables::new(),
            input: LineBuffer::new(),
            detect_link: None,
            writer,
            tasks: [reader, writer_task],
            child,
        }
    }

    /// Identity for log lines and death messages
    pub fn label(&self) -> String {
        match self.uuid {
            Some(uuid) => uuid.to_string(),
            None => self.key.to_string(),
        }
    }

    /// Send a call. If the worker's stdin is gone the waiter is handed back
    /// so the caller can fail it on the next tick.
    pub fn call(
        &mut self,
        method: DeviceMethod,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        waiter: Waiter,
    ) -> Result<CallId, Waiter> {
        let id = self.waiters.next_id();
        let line = Request::new(id, method.as_str(), args, kwargs).encode();
        trace!("{} <- {}", self.label(), String::from_utf8_lossy(&line).trim_end());
        if self.writer.send(line).is_err() {
            warn!("Killing printer handle of {} because of write error", self.label());
            return Err(waiter);
        }
        self.waiters.insert(WaitTable::Generic, id, waiter);
        Ok(id)
    }

    /// Register a waiter that the worker resolves on its own
    pub fn wait(&mut self, table: WaitTable, waiter: Waiter) -> CallId {
        self.waiters.issue(table, waiter)
    }

    /// Drop the link kept open during detection
    pub fn close_detect_link(&mut self) {
        if self.detect_link.take().is_some() {
            debug!("Closing detection link of {}", self.label());
        }
    }

    /// Stop the I/O tasks and kill the process
    pub fn kill(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("Killing worker of {}: {}", self.label(), e);
            }
        }
        self.detect_link = None;
    }
}

impl Drop for Printer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Call,
        Move,
        Temp,
        Resolve(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Call),
            Just(Op::Move),
            Just(Op::Temp),
            any::<usize>().prop_map(Op::Resolve),
        ]
    }

    proptest! {
        #[test]
        fn call_ids_increase_and_live_in_one_table(ops in prop::collection::vec(op(), 1..200)) {
            let mut tables: WaiterTables<CallId> = WaiterTables::new();
            let mut outstanding: Vec<(WaitTable, CallId)> = Vec::new();
            let mut last: Option<CallId> = None;
            let mut resolved = std::collections::HashSet::new();

            for op in ops {
                let table = match op {
                    Op::Call => WaitTable::Generic,
                    Op::Move => WaitTable::Motion,
                    Op::Temp => WaitTable::Temperature,
                    Op::Resolve(i) => {
                        if outstanding.is_empty() {
                            continue;
                        }
                        let (table, id) = outstanding.remove(i % outstanding.len());
                        prop_assert_eq!(tables.take(table, id), Some(id));
                        prop_assert_eq!(tables.take(table, id), None);
                        prop_assert!(resolved.insert(id));
                        continue;
                    }
                };
                let id = tables.next_id();
                tables.insert(table, id, id);
                if let Some(prev) = last {
                    prop_assert!(id > prev);
                }
                last = Some(id);
                outstanding.push((table, id));

                for (_, id) in &outstanding {
                    prop_assert_eq!(tables.tables_holding(*id), 1);
                }
            }

            prop_assert_eq!(tables.len(), outstanding.len());
            let drained = tables.drain();
            prop_assert_eq!(drained.len(), outstanding.len());
            prop_assert!(tables.is_empty());
        }
    }

    #[test]
    fn test_drain_fails_every_table() {
        let mut tables: WaiterTables<&str> = WaiterTables::new();
        tables.issue(WaitTable::Generic, "a");
        tables.issue(WaitTable::Motion, "b");
        tables.issue(WaitTable::Generic, "c");
        assert_eq!(tables.drain(), vec!["a", "c", "b"]);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_id_panics() {
        let mut tables: WaiterTables<()> = WaiterTables::new();
        tables.insert(WaitTable::Generic, 0, ());
        tables.insert(WaitTable::Motion, 0, ());
        tables.insert(WaitTable::Motion, 0, ());
    }

    #[tokio::test]
    async fn test_call_writes_json_line() {
        let (host_in, mut worker_in) = tokio::io::duplex(1024);
        let (_worker_out, host_out) = tokio::io::duplex(1024);
        let (events, _rx) = mpsc::unbounded_channel();
        let process = WorkerProcess {
            stdin: Box::new(host_in),
            stdout: Box::new(host_out),
            child: None,
        };
        let mut printer = Printer::start(PrinterKey(1), process, None, None, events);

        let id = printer
            .call(DeviceMethod::GetGlobals, vec!["admin".into()], Map::new(), Waiter::Ignore)
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(printer.wait(WaitTable::Motion, Waiter::Ignore), 1);

        let mut buf = vec![0u8; 64];
        let n = worker_in.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"[0,\"get_globals\",[\"admin\"],{}]\n");
        assert_eq!(printer.waiters.len(), 2);
    }
}
