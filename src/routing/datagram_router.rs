use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, instrument, trace, warn};

use crate::message::{DatagramMessage, Message};
use crate::peer::connection::{PeerClass, PeerConnection};
use crate::router::context::RouterContext;
use crate::routing::routing_table::RoutingTable;
use crate::util::random::Random;


/// Routes datagrams to datagram peers, sending all datagrams from the same source address and
///  port to the same peer for as long as that peer stays connected.
#[derive(Default)]
pub struct DatagramRouter {
    affinities: FxHashMap<(String, u16), u64>,
}

impl DatagramRouter {
    pub fn new() -> DatagramRouter {
        Default::default()
    }

    /// Picks the peer for a datagram. Affinities to peers that are gone are replaced when they
    ///  are looked up, i.e. there is no cleanup when a peer disconnects.
    pub async fn route<R: Random>(&mut self, routing: &RoutingTable, msg: &DatagramMessage) -> Option<Arc<PeerConnection>> {
        let key = (msg.source_address.clone(), msg.source_port);

        if let Some(conn_id) = self.affinities.get(&key).copied() {
            match routing.datagram_peer(conn_id).await {
                Some(conn) if conn.is_alive() => return Some(conn),
                _ => {
                    debug!("peer {} for {}:{} is gone", conn_id, msg.source_address, msg.source_port);
                    self.affinities.remove(&key);
                }
            }
        }

        let conn = routing.least_loaded_datagram_peer::<R>().await?;
        conn.increment_load();
        trace!("routing datagrams from {}:{} to peer {}", msg.source_address, msg.source_port, conn.id());
        self.affinities.insert(key, conn.id());
        Some(conn)
    }

    pub fn num_affinities(&self) -> usize {
        self.affinities.len()
    }
}

/// Routes datagrams from the inbound datagram queue until it is closed and empty, then closes
///  the outgoing queues of all datagram peers.
#[instrument(name = "datagram_router", skip_all)]
pub async fn run_datagram_router<R: Random>(ctx: Arc<RouterContext>) {
    let mut router = DatagramRouter::new();

    loop {
        ctx.shutdown.wait_while_suspended().await;

        let msg = match ctx.inbound_datagrams.pop().await {
            Some(msg) => msg,
            None => break,
        };

        match router.route::<R>(&ctx.routing, &msg).await {
            Some(conn) => {
                if let Err(Message::Datagram(msg)) = conn.outgoing().push(Message::Datagram(msg)).await {
                    warn!("peer {} no longer takes datagrams, discarding datagram from {}:{}", conn.id(), msg.source_address, msg.source_port);
                }
            }
            None => warn!("no datagram peers connected, discarding datagram from {}:{}", msg.source_address, msg.source_port),
        }
    }

    ctx.set_routing_done(PeerClass::Datagram);
    for conn in ctx.routing.datagram_peers().await {
        conn.outgoing().close().await;
    }
    debug!("datagram router finished");
}

/// Passes datagrams from datagram peers to the carrier layer until the queue is closed
#[instrument(name = "datagram_forwarder", skip_all)]
pub async fn run_datagram_forwarder(ctx: Arc<RouterContext>) {
    while let Some(msg) = ctx.outgoing_datagrams.pop().await {
        ctx.carrier.submit_datagram(msg).await;
    }
    debug!("datagram forwarder finished");
}
