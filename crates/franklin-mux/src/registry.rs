//! Port registry
//!
//! Every known port is in exactly one of three states: idle, busy with a
//! cancellable operation (detection or firmware flashing), or bound to a
//! running printer. Transitions that would break this are programming
//! errors and panic.

use std::collections::BTreeMap;
use std::fmt;

use franklin_detect::PortFilter;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::events::PortStatus;

/// In-memory handle of a running printer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrinterKey(pub u64);

impl fmt::Display for PrinterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What keeps a port busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyKind {
    /// Identify handshake in progress
    Detecting,
    /// Firmware upload in progress
    Flashing,
}

/// Cancel capability of the operation that owns a port
#[derive(Debug)]
pub struct BusyHandle {
    kind: BusyKind,
    attempt: u64,
    abort: AbortHandle,
}

impl BusyHandle {
    /// Wrap the abort handle of the task owning the port
    pub fn new(kind: BusyKind, attempt: u64, abort: AbortHandle) -> Self {
        Self {
            kind,
            attempt,
            abort,
        }
    }

    /// Kind of operation
    pub fn kind(&self) -> BusyKind {
        self.kind
    }

    /// Attempt number the owning task reports back with
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Abort the owning task. Consumes the handle, so this happens once.
    pub fn cancel(self) {
        self.abort.abort();
    }
}

/// State of a single port
#[derive(Debug)]
pub enum PortState {
    /// Nothing running, no printer attached
    Idle,
    /// An operation owns the port
    Busy(BusyHandle),
    /// A printer is attached
    Bound(PrinterKey),
}

impl PortState {
    /// Status code announced to observers
    pub fn status(&self) -> PortStatus {
        match self {
            PortState::Idle => PortStatus::Idle,
            PortState::Busy(handle) => match handle.kind() {
                BusyKind::Detecting => PortStatus::Detecting,
                BusyKind::Flashing => PortStatus::Flashing,
            },
            PortState::Bound(_) => PortStatus::Connected,
        }
    }

    /// Whether the port is idle
    pub fn is_idle(&self) -> bool {
        matches!(self, PortState::Idle)
    }
}

/// All known ports and their states
#[derive(Debug)]
pub struct PortRegistry {
    ports: BTreeMap<String, PortState>,
    filter: PortFilter,
    next_attempt: u64,
}

impl PortRegistry {
    /// Create an empty registry rejecting ports matched by `filter`
    pub fn new(filter: PortFilter) -> Self {
        Self {
            ports: BTreeMap::new(),
            filter,
            next_attempt: 0,
        }
    }

    /// Insert a new idle port. Returns `false` for known or blacklisted
    /// ports.
    pub fn insert(&mut self, port: &str) -> bool {
        if self.ports.contains_key(port) {
            debug!("Already existing port {} cannot be added", port);
            return false;
        }
        if self.filter.is_blacklisted(port) {
            debug!("Skipping blacklisted port {}", port);
            return false;
        }
        self.ports.insert(port.to_string(), PortState::Idle);
        true
    }

    /// Delete a port, returning its last state
    pub fn remove(&mut self, port: &str) -> Option<PortState> {
        self.ports.remove(port)
    }

    /// Whether the port is known
    pub fn contains(&self, port: &str) -> bool {
        self.ports.contains_key(port)
    }

    /// Current state of a port
    pub fn state(&self, port: &str) -> Option<&PortState> {
        self.ports.get(port)
    }

    /// Printer bound to the port, if any
    pub fn bound_to(&self, port: &str) -> Option<PrinterKey> {
        match self.ports.get(port) {
            Some(PortState::Bound(key)) => Some(*key),
            _ => None,
        }
    }

    /// All ports in order
    pub fn ports(&self) -> impl Iterator<Item = (&str, &PortState)> {
        self.ports.iter().map(|(port, state)| (port.as_str(), state))
    }

    /// Names of all idle ports
    pub fn idle_ports(&self) -> Vec<String> {
        self.ports
            .iter()
            .filter(|(_, state)| state.is_idle())
            .map(|(port, _)| port.clone())
            .collect()
    }

    /// Number of known ports
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether no ports are known
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Reserve an attempt number for a new busy operation
    pub fn next_attempt(&mut self) -> u64 {
        self.next_attempt += 1;
        self.next_attempt
    }

    /// Mark an idle port busy.
    ///
    /// # Panics
    ///
    /// Panics if the port is unknown or not idle.
    pub fn set_busy(&mut self, port: &str, handle: BusyHandle) {
        let state = self.state_mut(port);
        assert!(
            state.is_idle(),
            "port {port} entered busy state from {:?}",
            state.status()
        );
        *state = PortState::Busy(handle);
    }

    /// Return a busy port to idle if `attempt` still owns it.
    ///
    /// Returns `None` for results of cancelled or superseded attempts.
    pub fn clear_busy(&mut self, port: &str, attempt: u64) -> Option<BusyKind> {
        let state = self.ports.get_mut(port)?;
        let kind = match state {
            PortState::Busy(handle) if handle.attempt() == attempt => handle.kind(),
            _ => return None,
        };
        *state = PortState::Idle;
        Some(kind)
    }

    /// Take the busy handle of a port, leaving it idle
    pub fn take_busy(&mut self, port: &str) -> Option<BusyHandle> {
        let state = self.ports.get_mut(port)?;
        if !matches!(state, PortState::Busy(_)) {
            return None;
        }
        match std::mem::replace(state, PortState::Idle) {
            PortState::Busy(handle) => Some(handle),
            _ => None,
        }
    }

    /// Attach a printer to an idle port.
    ///
    /// # Panics
    ///
    /// Panics if the port is unknown or not idle.
    pub fn bind(&mut self, port: &str, key: PrinterKey) {
        let state = self.state_mut(port);
        assert!(
            state.is_idle(),
            "port {port} bound to {key} from {:?}",
            state.status()
        );
        *state = PortState::Bound(key);
    }

    /// Detach the printer from a port if `key` is the one bound there
    pub fn release(&mut self, port: &str, key: PrinterKey) -> bool {
        match self.ports.get_mut(port) {
            Some(state) if matches!(*state, PortState::Bound(k) if k == key) => {
                *state = PortState::Idle;
                true
            }
            _ => false,
        }
    }

    fn state_mut(&mut self, port: &str) -> &mut PortState {
        match self.ports.get_mut(port) {
            Some(state) => state,
            None => panic!("port {port} is not registered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PortRegistry {
        PortRegistry::new(PortFilter::with_defaults::<&str>(&[]).unwrap())
    }

    async fn busy_handle(registry: &mut PortRegistry, kind: BusyKind) -> (BusyHandle, tokio::task::JoinHandle<()>) {
        let task = tokio::spawn(std::future::pending::<()>());
        let attempt = registry.next_attempt();
        (BusyHandle::new(kind, attempt, task.abort_handle()), task)
    }

    #[test]
    fn test_insert_rejects_known_and_blacklisted() {
        let mut registry = registry();
        assert!(registry.insert("/dev/ttyUSB0"));
        assert!(!registry.insert("/dev/ttyUSB0"));
        assert!(!registry.insert("/dev/ptmx"));
        assert!(!registry.insert("/dev/tty3"));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.state("/dev/ttyUSB0").map(PortState::status),
            Some(PortStatus::Idle)
        );
    }

    #[tokio::test]
    async fn test_busy_lifecycle() {
        let mut registry = registry();
        registry.insert("/dev/ttyACM0");

        let (handle, _task) = busy_handle(&mut registry, BusyKind::Detecting).await;
        let attempt = handle.attempt();
        registry.set_busy("/dev/ttyACM0", handle);
        assert_eq!(
            registry.state("/dev/ttyACM0").map(PortState::status),
            Some(PortStatus::Detecting)
        );

        // stale attempt does not clear
        assert_eq!(registry.clear_busy("/dev/ttyACM0", attempt + 7), None);
        assert_eq!(
            registry.clear_busy("/dev/ttyACM0", attempt),
            Some(BusyKind::Detecting)
        );
        assert!(registry.state("/dev/ttyACM0").unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_cancel_aborts_task() {
        let mut registry = registry();
        registry.insert("/dev/ttyUSB1");

        let (handle, task) = busy_handle(&mut registry, BusyKind::Flashing).await;
        registry.set_busy("/dev/ttyUSB1", handle);

        let handle = registry.take_busy("/dev/ttyUSB1").unwrap();
        assert_eq!(handle.kind(), BusyKind::Flashing);
        handle.cancel();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(registry.take_busy("/dev/ttyUSB1").is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "entered busy state")]
    async fn test_double_busy_panics() {
        let mut registry = registry();
        registry.insert("/dev/ttyUSB2");
        let (first, _a) = busy_handle(&mut registry, BusyKind::Detecting).await;
        let (second, _b) = busy_handle(&mut registry, BusyKind::Detecting).await;
        registry.set_busy("/dev/ttyUSB2", first);
        registry.set_busy("/dev/ttyUSB2", second);
    }

    #[test]
    #[should_panic(expected = "bound to")]
    fn test_double_bind_panics() {
        let mut registry = registry();
        registry.insert("-");
        registry.bind("-", PrinterKey(1));
        registry.bind("-", PrinterKey(2));
    }

    #[test]
    fn test_release_checks_owner() {
        let mut registry = registry();
        registry.insert("/dev/x");
        registry.bind("/dev/x", PrinterKey(4));
        assert!(!registry.release("/dev/x", PrinterKey(5)));
        assert_eq!(registry.bound_to("/dev/x"), Some(PrinterKey(4)));
        assert!(registry.release("/dev/x", PrinterKey(4)));
        assert_eq!(registry.idle_ports(), vec!["/dev/x".to_string()]);
    }
}
