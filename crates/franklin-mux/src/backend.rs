//! Seams to the outside world
//!
//! The coordinator never touches serial ports, processes or flashing tools
//! directly. It goes through the traits in this module, so the same code
//! runs against real hardware ([`SystemBackend`]) and against simulated
//! devices in tests.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use franklin_detect::{open_link, DetectError};
use franklin_protocol::DeviceId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::MuxError;
use crate::firmware::{FlashRequest, FlashTemplates};

/// Boxed future returned by backend operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Byte link to a device
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Link for T {}

/// Owned link to a device
pub type BoxedLink = Box<dyn Link>;

/// Opens ports for the identify handshake
pub trait PortOpener: Send + Sync {
    /// Run the pre-detect command for `port`, if any, and wait for it
    fn predetect<'a>(&'a self, port: &'a str) -> BoxFuture<'a, ()>;

    /// Open `port` at `baud_rate`
    fn open(&self, port: &str, baud_rate: u32) -> Result<BoxedLink, DetectError>;
}

/// How a worker is started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Identity of the device, `None` to have the worker mint one
    pub uuid: Option<DeviceId>,
    /// Port the device sits on, `None` for a detached worker
    pub port: Option<String>,
    /// Policy restricting system commands run by jobs
    pub allow_system: String,
}

/// A started worker process
pub struct WorkerProcess {
    /// Worker standard input
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Worker standard output
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// OS process, absent for in-process workers
    pub child: Option<Child>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("child", &self.child.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

/// Starts worker processes
pub trait WorkerSpawner: Send + Sync {
    /// Start a worker
    fn spawn(&self, args: &WorkerArgs) -> Result<WorkerProcess, MuxError>;
}

/// Runs firmware uploads. Dropping the returned future stops the upload.
pub trait FirmwareFlasher: Send + Sync {
    /// Flash and return `Err(output)` if the tool reported anything
    fn flash(&self, request: FlashRequest) -> BoxFuture<'static, Result<(), String>>;
}

/// Everything the coordinator needs from the outside world
#[derive(Clone)]
pub struct Backend {
    /// Port access for detection
    pub opener: Arc<dyn PortOpener>,
    /// Worker process creation
    pub spawner: Arc<dyn WorkerSpawner>,
    /// Firmware uploads
    pub flasher: Arc<dyn FirmwareFlasher>,
}

impl Backend {
    /// Bundle backend parts
    pub fn new(
        opener: Arc<dyn PortOpener>,
        spawner: Arc<dyn WorkerSpawner>,
        flasher: Arc<dyn FirmwareFlasher>,
    ) -> Self {
        Self {
            opener,
            spawner,
            flasher,
        }
    }
}

/// Configuration of the real backend
#[derive(Debug, Clone, Default)]
pub struct SystemBackend {
    /// Shell command run before opening a port; `#PORT#` is substituted
    pub predetect: Option<String>,
    /// Worker program
    pub driver: String,
    /// Extra arguments passed to every worker
    pub driver_args: Vec<String>,
    /// Firmware command templates
    pub flash: FlashTemplates,
}

impl SystemBackend {
    /// Turn into a [`Backend`]
    pub fn into_backend(self) -> Backend {
        let shared = Arc::new(self);
        Backend::new(shared.clone(), shared.clone(), shared)
    }
}

impl PortOpener for SystemBackend {
    fn predetect<'a>(&'a self, port: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(template) = self.predetect.as_deref().filter(|t| !t.is_empty()) else {
                return;
            };
            let command = template.replace("#PORT#", port);
            debug!("Running predetect: {}", command);
            match Command::new("sh").arg("-c").arg(&command).status().await {
                Ok(status) if !status.success() => {
                    warn!("Predetect for {} exited with {}", port, status)
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to run predetect for {}: {}", port, e),
            }
        })
    }

    fn open(&self, port: &str, baud_rate: u32) -> Result<BoxedLink, DetectError> {
        let stream = open_link(port, baud_rate)?;
        Ok(Box::new(stream))
    }
}

impl WorkerSpawner for SystemBackend {
    fn spawn(&self, args: &WorkerArgs) -> Result<WorkerProcess, MuxError> {
        let mut command = Command::new(&self.driver);
        command
            .arg("--uuid")
            .arg(args.uuid.map(|u| u.to_string()).unwrap_or_default())
            .arg("--allow-system")
            .arg(&args.allow_system)
            .args(&self.driver_args);
        if let Some(port) = &args.port {
            command.arg("--port").arg(port);
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MuxError::SpawnFailed(format!("{}: {}", self.driver, e)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(MuxError::SpawnFailed("worker pipes unavailable".to_string()));
        };
        info!("Started worker {} (pid {:?})", self.driver, child.id());
        Ok(WorkerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: Some(child),
        })
    }
}

impl FirmwareFlasher for SystemBackend {
    fn flash(&self, request: FlashRequest) -> BoxFuture<'static, Result<(), String>> {
        let argv = self.flash.expand(&request);
        Box::pin(async move {
            let Some((program, args)) = argv.split_first() else {
                return Err(format!("\nError writing {} firmware: empty command", request.board));
            };
            info!("Flashing firmware: {}", argv.join(" "));
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| format!("\nError writing {} firmware: {}", request.board, e))?;

            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            if !text.is_empty() {
                Err(text)
            } else if !output.status.success() {
                Err(format!("flasher exited with {}", output.status))
            } else {
                Ok(())
            }
        })
    }
}
