use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{split_list, RouteConfig};
use crate::message::DataMessage;
use crate::peer::connection::{PeerClass, PeerConnection};
use crate::util::random::{start_offset, Random};


/// The static routing rules, mapping carrier ids and shortcodes to peer names. They are built
///  once from configuration and never change afterwards.
#[derive(Debug, Default)]
pub struct RoutingRules {
    by_carrier: FxHashMap<String, String>,
    by_shortcode: FxHashMap<String, String>,
    /// keyed by "shortcode:carrier-id"
    by_shortcode_and_carrier: FxHashMap<String, String>,
}

impl RoutingRules {
    pub fn from_config(routes: &[RouteConfig]) -> anyhow::Result<RoutingRules> {
        let mut result = RoutingRules::default();

        for route in routes {
            let name = route.peer_name.trim();
            let carrier_ids = route.carrier_ids.as_deref().map(split_list);
            let shortcodes = route.shortcodes.as_deref().map(split_list);

            match (carrier_ids, shortcodes) {
                (Some(carrier_ids), None) => {
                    for carrier_id in carrier_ids {
                        Self::add_rule(&mut result.by_carrier, carrier_id, name, "carrier id")?;
                    }
                }
                (None, Some(shortcodes)) => {
                    for shortcode in shortcodes {
                        Self::add_rule(&mut result.by_shortcode, shortcode, name, "shortcode")?;
                    }
                }
                (Some(carrier_ids), Some(shortcodes)) => {
                    for shortcode in &shortcodes {
                        for carrier_id in &carrier_ids {
                            Self::add_rule(&mut result.by_shortcode_and_carrier, Self::combined_key(shortcode, carrier_id), name, "shortcode and carrier id")?;
                        }
                    }
                }
                (None, None) => bail!("route for peer {} has neither carrier ids nor shortcodes", name),
            }
        }

        debug!("{} carrier rules, {} shortcode rules, {} combined rules", result.by_carrier.len(), result.by_shortcode.len(), result.by_shortcode_and_carrier.len());
        Ok(result)
    }

    fn add_rule(rules: &mut FxHashMap<String, String>, key: String, peer_name: &str, description: &str) -> anyhow::Result<()> {
        if let Some(existing) = rules.get(&key) {
            bail!("{} '{}' is routed to both '{}' and '{}'", description, key, existing, peer_name);
        }
        rules.insert(key, peer_name.to_string());
        Ok(())
    }

    fn combined_key(shortcode: &str, carrier_id: &str) -> String {
        format!("{}:{}", shortcode, carrier_id)
    }

    /// The peer name a message is routed to based on its shortcode and carrier, if any. The
    ///  combination of shortcode and carrier takes precedence over just the shortcode, which
    ///  in turn takes precedence over just the carrier.
    pub fn resolve(&self, shortcode: &str, carrier_id: Option<&str>) -> Option<&str> {
        if let Some(carrier_id) = carrier_id {
            if let Some(name) = self.by_shortcode_and_carrier.get(&Self::combined_key(shortcode, carrier_id)) {
                return Some(name.as_str());
            }
        }
        if let Some(name) = self.by_shortcode.get(shortcode) {
            return Some(name.as_str());
        }
        carrier_id
            .and_then(|carrier_id| self.by_carrier.get(carrier_id))
            .map(|name| name.as_str())
    }
}


/// The outcome of looking for a message peer to deliver a data message to
#[derive(Debug)]
pub enum PeerSelection {
    Selected(Arc<PeerConnection>),
    /// there are no message peers connected at all
    NoPeers,
    /// the message is routed to a name, but no live peer with that name is connected
    NameNotConnected(String),
    /// every connection with the message's target name has a full queue
    NamedGroupFull(String),
    /// there is no routable peer without a name
    NoneRoutable,
    /// there are routable peers without a name, but all of their queues are full
    AllFull,
}

#[derive(Default)]
struct Registry {
    message_peers: Vec<Arc<PeerConnection>>,
    datagram_peers: Vec<Arc<PeerConnection>>,
    by_name: FxHashMap<String, Vec<Arc<PeerConnection>>>,
    names: FxHashMap<u64, String>,
}
impl Registry {
    fn peers_mut(&mut self, class: PeerClass) -> &mut Vec<Arc<PeerConnection>> {
        match class {
            PeerClass::Message => &mut self.message_peers,
            PeerClass::Datagram => &mut self.datagram_peers,
        }
    }

    fn is_registered(&self, conn: &PeerConnection) -> bool {
        let peers = match conn.class() {
            PeerClass::Message => &self.message_peers,
            PeerClass::Datagram => &self.datagram_peers,
        };
        peers.iter().any(|c| c.id() == conn.id())
    }

    fn remove_from_group(&mut self, name: &str, conn_id: u64) {
        if let Some(group) = self.by_name.get_mut(name) {
            group.retain(|c| c.id() != conn_id);
            if group.is_empty() {
                self.by_name.remove(name);
            }
        }
    }
}

enum Scan {
    Found(Arc<PeerConnection>),
    Full,
    NoCandidate,
}

/// Routing rules plus the registry of currently connected peers and their names.
///
/// Connections are registered for as long as they are alive, and a connection is part of its
///  name's group exactly while it is registered and identified with that name. The registry is
///  guarded by a single reader / writer lock: routing decisions take the read lock, while
///  (de)registration and identification take the write lock.
pub struct RoutingTable {
    rules: RoutingRules,
    registry: RwLock<Registry>,
}

impl RoutingTable {
    pub fn new(rules: RoutingRules) -> RoutingTable {
        RoutingTable {
            rules,
            registry: Default::default(),
        }
    }

    pub fn rules(&self) -> &RoutingRules {
        &self.rules
    }

    pub async fn register(&self, conn: Arc<PeerConnection>) {
        debug!("registering connection {} from {}", conn.id(), conn.addr());
        self.registry.write().await
            .peers_mut(conn.class())
            .push(conn);
    }

    pub async fn deregister(&self, conn: &PeerConnection) {
        let mut registry = self.registry.write().await;
        registry.peers_mut(conn.class())
            .retain(|c| c.id() != conn.id());
        if let Some(name) = registry.names.remove(&conn.id()) {
            registry.remove_from_group(&name, conn.id());
        }
        debug!("deregistered connection {} from {}", conn.id(), conn.addr());
    }

    /// Registers the connection under `name`, moving it out of the group for its previous name
    ///  if it had one. Returns false if nothing changed, i.e. if the connection already had that
    ///  name, is not registered (anymore), or is not a message peer.
    pub async fn identify(&self, conn: &Arc<PeerConnection>, name: String) -> bool {
        if conn.class() != PeerClass::Message {
            warn!("{:?} peer {} tried to identify as {} - only message peers have names", conn.class(), conn.id(), name);
            return false;
        }

        let mut registry = self.registry.write().await;
        if !registry.is_registered(conn) {
            debug!("connection {} identified as {} after it was deregistered - ignoring", conn.id(), name);
            return false;
        }
        if registry.names.get(&conn.id()) == Some(&name) {
            return false;
        }

        if let Some(old_name) = registry.names.remove(&conn.id()) {
            info!("connection {} changes its name from {} to {}", conn.id(), old_name, name);
            registry.remove_from_group(&old_name, conn.id());
        }
        else {
            info!("connection {} from {} identified as {}", conn.id(), conn.addr(), name);
        }

        registry.by_name.entry(name.clone())
            .or_default()
            .push(conn.clone());
        registry.names.insert(conn.id(), name);
        true
    }

    pub async fn sticky_name(&self, conn_id: u64) -> Option<String> {
        self.registry.read().await
            .names.get(&conn_id)
            .cloned()
    }

    pub async fn group_len(&self, name: &str) -> usize {
        self.registry.read().await
            .by_name.get(name)
            .map(|group| group.len())
            .unwrap_or(0)
    }

    pub async fn message_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.registry.read().await
            .message_peers.clone()
    }

    pub async fn datagram_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.registry.read().await
            .datagram_peers.clone()
    }

    /// all registered connections with their names
    pub async fn connections(&self) -> Vec<(Arc<PeerConnection>, Option<String>)> {
        let registry = self.registry.read().await;
        registry.message_peers.iter()
            .chain(registry.datagram_peers.iter())
            .map(|c| (c.clone(), registry.names.get(&c.id()).cloned()))
            .collect()
    }

    /// Picks the message peer a data message should be delivered to.
    ///
    /// The target name is the message's explicit sticky name, or else the name the rules
    ///  resolve for it. If there is a target name, one of the connections with that name is
    ///  picked; otherwise one of the routable connections that have no name. Either way, only
    ///  connections with room in their outgoing queue qualify, and the scan for a qualifying
    ///  connection starts at a random offset to spread load.
    pub async fn select_message_peer<R: Random>(&self, msg: &DataMessage, max_queue_length: Option<usize>) -> PeerSelection {
        let registry = self.registry.read().await;
        if registry.message_peers.is_empty() {
            return PeerSelection::NoPeers;
        }

        let target_name = msg.sticky_name.as_deref()
            .or_else(|| self.rules.resolve(&msg.receiver, msg.carrier_id.as_deref()));

        match target_name {
            Some(name) => {
                let group = match registry.by_name.get(name) {
                    Some(group) if !group.is_empty() => group,
                    _ => return PeerSelection::NameNotConnected(name.to_string()),
                };
                match Self::scan::<R>(group, max_queue_length, |_| true).await {
                    Scan::Found(conn) => PeerSelection::Selected(conn),
                    Scan::Full => PeerSelection::NamedGroupFull(name.to_string()),
                    // only dead connections are left in the group, they are about to be deregistered
                    Scan::NoCandidate => PeerSelection::NameNotConnected(name.to_string()),
                }
            }
            None => {
                let is_unnamed_and_routable = |c: &PeerConnection| c.is_routable() && !registry.names.contains_key(&c.id());
                match Self::scan::<R>(&registry.message_peers, max_queue_length, is_unnamed_and_routable).await {
                    Scan::Found(conn) => PeerSelection::Selected(conn),
                    Scan::Full => PeerSelection::AllFull,
                    Scan::NoCandidate => PeerSelection::NoneRoutable,
                }
            }
        }
    }

    async fn scan<R: Random>(candidates: &[Arc<PeerConnection>], max_queue_length: Option<usize>, eligible: impl Fn(&PeerConnection) -> bool) -> Scan {
        let start = start_offset::<R>(candidates.len());
        let mut any_eligible = false;

        for i in 0..candidates.len() {
            let conn = &candidates[(start + i) % candidates.len()];
            if !conn.is_alive() || !eligible(conn) {
                continue;
            }
            any_eligible = true;

            let has_capacity = match max_queue_length {
                None => true,
                Some(max) => conn.outgoing().len().await < max,
            };
            if has_capacity {
                return Scan::Found(conn.clone());
            }
        }

        if any_eligible {
            Scan::Full
        }
        else {
            Scan::NoCandidate
        }
    }

    pub async fn datagram_peer(&self, conn_id: u64) -> Option<Arc<PeerConnection>> {
        self.registry.read().await
            .datagram_peers.iter()
            .find(|c| c.id() == conn_id)
            .cloned()
    }

    /// The datagram peer with the lowest load. Among peers with equal load, the first one after
    ///  a random offset in registration order wins, so ties are not broken uniformly.
    pub async fn least_loaded_datagram_peer<R: Random>(&self) -> Option<Arc<PeerConnection>> {
        let registry = self.registry.read().await;
        let peers = &registry.datagram_peers;
        if peers.is_empty() {
            return None;
        }

        let start = start_offset::<R>(peers.len());
        let mut best = &peers[start];
        for i in 1..peers.len() {
            let candidate = &peers[(start + i) % peers.len()];
            if candidate.load() < best.load() {
                best = candidate;
            }
        }
        Some(best.clone())
    }
}
