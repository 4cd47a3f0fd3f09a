//! Simulated backend
//!
//! Plugs virtual devices, virtual workers and a fake flashing tool into the
//! coordinator's backend traits. Everything runs in-process over
//! `tokio::io::duplex` pipes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use franklin_detect::DetectError;
use franklin_mux::{
    Backend, BoxFuture, BoxedLink, FirmwareFlasher, FlashRequest, MuxError, PortOpener, WorkerArgs,
    WorkerProcess, WorkerSpawner,
};
use franklin_protocol::DeviceId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::{run_silent_device, run_virtual_device, VirtualDevice};
use crate::worker::{run_virtual_worker, RecordedCall, VirtualWorker, WorkerControl};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What sits behind a simulated port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortBehavior {
    /// A device that answers the identify handshake
    Device(VirtualDevice),
    /// Something that accepts bytes and never answers
    Silent,
}

/// Simulated ports, shared by the opener and the workers
#[derive(Debug, Clone, Default)]
pub struct DeviceTable(Arc<Mutex<HashMap<String, PortBehavior>>>);

impl DeviceTable {
    /// Put something behind `port`
    pub fn insert(&self, port: impl Into<String>, behavior: PortBehavior) {
        lock(&self.0).insert(port.into(), behavior);
    }

    /// Unplug whatever is behind `port`
    pub fn remove(&self, port: &str) -> Option<PortBehavior> {
        lock(&self.0).remove(port)
    }

    /// What is behind `port`
    pub fn behavior(&self, port: &str) -> Option<PortBehavior> {
        lock(&self.0).get(port).cloned()
    }

    /// The device behind `port`, if any
    pub fn device(&self, port: &str) -> Option<VirtualDevice> {
        match self.behavior(port) {
            Some(PortBehavior::Device(device)) => Some(device),
            _ => None,
        }
    }

    /// Modify the device behind `port`
    pub fn update(&self, port: &str, f: impl FnOnce(&mut VirtualDevice)) {
        if let Some(PortBehavior::Device(device)) = lock(&self.0).get_mut(port) {
            f(device);
        }
    }
}

/// Test-side view of a spawned virtual worker
#[derive(Debug, Clone)]
pub struct SimWorkerHandle {
    args: WorkerArgs,
    control: mpsc::UnboundedSender<WorkerControl>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl SimWorkerHandle {
    /// Arguments the worker was started with
    pub fn args(&self) -> &WorkerArgs {
        &self.args
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Names of the methods received so far
    pub fn methods(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.method.clone()).collect()
    }

    /// Send a control message; returns `false` once the worker exited
    pub fn send(&self, control: WorkerControl) -> bool {
        self.control.send(control).is_ok()
    }

    /// Make the worker exit without a word
    pub fn crash(&self) -> bool {
        self.send(WorkerControl::Crash)
    }

    /// Make the worker release its port
    pub fn disconnect(&self) -> bool {
        self.send(WorkerControl::Disconnect)
    }

    /// Stop answering `method`
    pub fn hold(&self, method: &str) -> bool {
        self.send(WorkerControl::Hold(method.to_string()))
    }

    /// Whether the worker exited
    pub fn is_gone(&self) -> bool {
        self.control.is_closed()
    }
}

/// Fake flashing tool
#[derive(Debug, Clone)]
pub struct SimFlasher {
    outcome: Arc<Mutex<(Duration, Result<(), String>)>>,
    requests: Arc<Mutex<Vec<FlashRequest>>>,
}

impl Default for SimFlasher {
    fn default() -> Self {
        Self {
            outcome: Arc::new(Mutex::new((Duration::from_secs(1), Ok(())))),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl SimFlasher {
    /// Make future uploads take `duration` and end with `result`
    pub fn set_outcome(&self, duration: Duration, result: Result<(), String>) {
        *lock(&self.outcome) = (duration, result);
    }

    /// Uploads started so far
    pub fn requests(&self) -> Vec<FlashRequest> {
        lock(&self.requests).clone()
    }
}

impl FirmwareFlasher for SimFlasher {
    fn flash(&self, request: FlashRequest) -> BoxFuture<'static, Result<(), String>> {
        let (duration, result) = lock(&self.outcome).clone();
        lock(&self.requests).push(request);
        Box::pin(async move {
            tokio::time::sleep(duration).await;
            result
        })
    }
}

/// Backend made of simulated parts
#[derive(Debug, Clone, Default)]
pub struct SimBackend {
    devices: DeviceTable,
    workers: Arc<Mutex<Vec<SimWorkerHandle>>>,
    opened: Arc<Mutex<Vec<String>>>,
    spawn_failures: Arc<AtomicUsize>,
    flasher: SimFlasher,
}

impl SimBackend {
    /// An empty simulation
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated ports
    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    /// Plug `device` into `port`
    pub fn plug(&self, port: impl Into<String>, device: VirtualDevice) {
        self.devices.insert(port, PortBehavior::Device(device));
    }

    /// Put a silent device behind `port`
    pub fn plug_silent(&self, port: impl Into<String>) {
        self.devices.insert(port, PortBehavior::Silent);
    }

    /// Unplug whatever is behind `port`
    pub fn unplug(&self, port: &str) {
        self.devices.remove(port);
    }

    /// Make the next `count` spawns fail
    pub fn fail_spawns(&self, count: usize) {
        self.spawn_failures.store(count, Ordering::SeqCst);
    }

    /// Every worker spawned so far
    pub fn workers(&self) -> Vec<SimWorkerHandle> {
        lock(&self.workers).clone()
    }

    /// Most recent worker started for `port`
    pub fn worker_on(&self, port: &str) -> Option<SimWorkerHandle> {
        lock(&self.workers)
            .iter()
            .rev()
            .find(|w| w.args.port.as_deref() == Some(port))
            .cloned()
    }

    /// Most recent worker started for `uuid`
    pub fn worker_for(&self, uuid: DeviceId) -> Option<SimWorkerHandle> {
        lock(&self.workers)
            .iter()
            .rev()
            .find(|w| w.args.uuid == Some(uuid))
            .cloned()
    }

    /// Ports opened for detection so far, in order
    pub fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }

    /// The fake flashing tool
    pub fn flasher(&self) -> &SimFlasher {
        &self.flasher
    }

    /// Coordinator backend backed by this simulation
    pub fn backend(&self) -> Backend {
        let shared = Arc::new(self.clone());
        Backend::new(shared.clone(), shared, Arc::new(self.flasher.clone()))
    }
}

impl PortOpener for SimBackend {
    fn predetect<'a>(&'a self, _port: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn open(&self, port: &str, _baud_rate: u32) -> Result<BoxedLink, DetectError> {
        lock(&self.opened).push(port.to_string());
        let (host, device_side) = tokio::io::duplex(1024);
        match self.devices.behavior(port) {
            None => {
                return Err(DetectError::OpenFailed {
                    port: port.to_string(),
                    reason: "no such device".into(),
                })
            }
            Some(PortBehavior::Device(device)) => {
                tokio::spawn(run_virtual_device(device_side, device));
            }
            Some(PortBehavior::Silent) => {
                tokio::spawn(run_silent_device(device_side));
            }
        }
        Ok(Box::new(host))
    }
}

impl WorkerSpawner for SimBackend {
    fn spawn(&self, args: &WorkerArgs) -> Result<WorkerProcess, MuxError> {
        let failing = self
            .spawn_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MuxError::SpawnFailed("simulated spawn failure".into()));
        }

        let (host, worker_side) = tokio::io::duplex(64 * 1024);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let worker = VirtualWorker::new(args, self.devices.clone());
        lock(&self.workers).push(SimWorkerHandle {
            args: args.clone(),
            control: control_tx,
            calls: worker.calls(),
        });
        tokio::spawn(async move {
            if let Err(e) = run_virtual_worker(worker_side, worker, control_rx).await {
                debug!("Virtual worker ended with error: {}", e);
            }
        });

        let (stdout, stdin) = tokio::io::split(host);
        Ok(WorkerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: None,
        })
    }
}
