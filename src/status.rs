use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use crate::peer::connection::PeerClass;
use crate::shutdown::Phase;


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionStatus {
    pub id: u64,
    pub class: PeerClass,
    pub name: Option<String>,
    pub address: SocketAddr,
    pub uptime: Duration,
    /// messages waiting to be sent plus messages waiting for an acknowledgment
    pub queue_depth: usize,
    pub pending_acks: usize,
    pub load: i64,
    pub alive: bool,
    pub routable: bool,
}

/// A snapshot of the router's state
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouterStatus {
    pub phase: Phase,
    pub suspended: bool,
    pub connections: Vec<ConnectionStatus>,
    pub inbound_queue_len: usize,
    pub inbound_datagram_queue_len: usize,
    /// datagrams from datagram peers waiting for the carrier layer
    pub datagram_peer_queue_len: usize,
    pub carriers: Vec<String>,
    pub sent_to_carrier: u64,
    pub failed_to_carrier: u64,
}

impl RouterStatus {
    pub fn connection(&self, id: u64) -> Option<&ConnectionStatus> {
        self.connections.iter()
            .find(|c| c.id == id)
    }

    pub fn connection_by_name(&self, name: &str) -> Option<&ConnectionStatus> {
        self.connections.iter()
            .find(|c| c.name.as_deref() == Some(name))
    }
}

struct OnlineTime(Duration);
impl Display for OnlineTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let secs = self.0.as_secs();
        write!(f, "on-line {}d {}h {}m {}s", secs / 86400, (secs / 3600) % 24, (secs / 60) % 60, secs % 60)
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.class {
            PeerClass::Message => write!(f, "smsbox:{}, IP {} ({} queued), ({})",
                self.name.as_deref().unwrap_or("(none)"),
                self.address.ip(),
                self.queue_depth,
                OnlineTime(self.uptime),
            ),
            PeerClass::Datagram => write!(f, "wapbox, IP {} ({})", self.address.ip(), OnlineTime(self.uptime)),
        }
    }
}

/// Renders the connection list, one alive connection per line
impl Display for RouterStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut any = false;
        for conn in self.connections.iter().filter(|c| c.alive) {
            writeln!(f, "    {}", conn)?;
            any = true;
        }
        if !any {
            writeln!(f, "    No boxes connected")?;
        }
        Ok(())
    }
}
