//! Sessions and the broadcast fabric

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use franklin_protocol::DeviceId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::events::ServerEvent;

/// Identifier of a session, also used as broadcast target
pub type ConnectionId = u64;

/// Access level of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Operate the bound printer
    User,
    /// Also trigger detection and disable printers
    Expert,
    /// Also manage ports, printers and firmware
    Admin,
    /// Same rights as admin
    Benjamin,
}

impl Role {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Expert => "expert",
            Role::Admin => "admin",
            Role::Benjamin => "benjamin",
        }
    }

    /// May detect ports and disable printers
    pub fn can_detect(self) -> bool {
        matches!(self, Role::Expert | Role::Admin | Role::Benjamin)
    }

    /// May add or remove ports and printers, and upload firmware
    pub fn can_administer(self) -> bool {
        matches!(self, Role::Admin | Role::Benjamin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "expert" => Ok(Role::Expert),
            "admin" => Ok(Role::Admin),
            "benjamin" => Ok(Role::Benjamin),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// State of one session as seen by the coordinator
#[derive(Debug)]
pub(crate) struct Connection {
    pub role: Role,
    pub printer: Option<DeviceId>,
    pub monitor: bool,
    pub initialized: bool,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl Connection {
    /// Deliver an event to this session only, ignoring a closed receiver
    pub fn send(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn wants_events(&self) -> bool {
        self.monitor && self.initialized
    }
}

/// All open sessions
#[derive(Debug, Default)]
pub(crate) struct Connections {
    next_id: ConnectionId,
    map: BTreeMap<ConnectionId, Connection>,
}

impl Connections {
    pub fn open(
        &mut self,
        role: Role,
        printer: Option<DeviceId>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> ConnectionId {
        let id = self.next_id;
        self.next_id += 1;
        self.map.insert(
            id,
            Connection {
                role,
                printer,
                monitor: false,
                initialized: false,
                events,
            },
        );
        id
    }

    pub fn close(&mut self, id: ConnectionId) -> bool {
        self.map.remove(&id).is_some()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.map.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Deliver `event` to `target`, or to every monitoring session
    pub fn broadcast(&self, target: Option<ConnectionId>, event: ServerEvent) {
        match target {
            Some(id) => match self.map.get(&id) {
                None => debug!(
                    "Ignoring targeted broadcast of {} to missing connection {}",
                    event.name(),
                    id
                ),
                Some(conn) if conn.wants_events() => conn.send(event),
                Some(_) => trace!("Not broadcasting to {}: not monitoring", id),
            },
            None => {
                for conn in self.map.values().filter(|c| c.wants_events()) {
                    conn.send(event.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PortStatus;

    fn monitoring(conns: &mut Connections) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = conns.open(Role::User, None, tx);
        let conn = conns.get_mut(id).unwrap();
        conn.monitor = true;
        conn.initialized = true;
        (id, rx)
    }

    #[test]
    fn test_roles() {
        assert!(Role::Benjamin.can_administer());
        assert!(Role::Expert.can_detect());
        assert!(!Role::Expert.can_administer());
        assert!(!Role::User.can_detect());
        assert_eq!("admin".parse::<Role>(), Ok(Role::Admin));
    }

    #[test]
    fn test_untargeted_skips_non_monitoring() {
        let mut conns = Connections::default();
        let (_a, mut rx_a) = monitoring(&mut conns);
        let (tx, mut rx_b) = mpsc::unbounded_channel();
        conns.open(Role::Admin, None, tx);

        conns.broadcast(None, ServerEvent::port_state("/dev/x", PortStatus::Idle));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_targeted_delivery() {
        let mut conns = Connections::default();
        let (a, mut rx_a) = monitoring(&mut conns);
        let (_b, mut rx_b) = monitoring(&mut conns);

        conns.broadcast(Some(a), ServerEvent::Autodetect(true));
        assert_eq!(rx_a.try_recv().unwrap(), ServerEvent::Autodetect(true));
        assert!(rx_b.try_recv().is_err());

        // unknown target is dropped
        conns.broadcast(Some(99), ServerEvent::Autodetect(false));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let mut conns = Connections::default();
        let (id, rx) = monitoring(&mut conns);
        drop(rx);
        conns.broadcast(Some(id), ServerEvent::Autodetect(true));
        assert!(conns.close(id));
        assert_eq!(conns.len(), 0);
    }
}
