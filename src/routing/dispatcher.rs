use std::sync::Arc;

use tokio::select;
use tokio::time::sleep;
use tracing::{debug, info, instrument, trace, warn};

use crate::message::DataMessage;
use crate::peer::connection::PeerClass;
use crate::router::context::RouterContext;
use crate::routing::routing_table::PeerSelection;
use crate::shutdown::Phase;
use crate::util::random::Random;


#[derive(Debug)]
pub enum RouteOutcome {
    /// the message was queued for the connection with the given id
    Routed(u64),
    /// no peer can take the message right now, it went back to the inbound queue
    Requeued,
    Rejected(DataMessage, RouteFailure),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RouteFailure {
    /// no peer can take the message, and the inbound queue is at its length limit
    QueueFull,
    /// there are peers for the message, but all of their queues are full
    CapacityExhausted,
    /// the inbound queue is closed
    ShuttingDown,
}

/// Tries to hand a data message to a message peer.
///
/// If no suitable peer is connected, the message goes (back) to the inbound queue to wait for
///  one. If suitable peers are connected but all of them are at capacity, the message is
///  rejected so that the carrier layer can apply backpressure.
pub async fn route_incoming<R: Random>(ctx: &RouterContext, msg: DataMessage) -> RouteOutcome {
    let max_queue_length = ctx.config.max_queue_length;

    match ctx.routing.select_message_peer::<R>(&msg, max_queue_length).await {
        PeerSelection::Selected(conn) => {
            conn.increment_load();
            let conn_id = conn.id();
            match conn.enqueue_data(msg).await {
                Ok(()) => {
                    trace!("routed message to connection {}", conn_id);
                    RouteOutcome::Routed(conn_id)
                }
                Err(msg) => {
                    debug!("connection {} no longer takes messages", conn_id);
                    requeue_bounded(ctx, msg).await
                }
            }
        }
        PeerSelection::NoPeers => {
            trace!("no message peers connected");
            requeue_bounded(ctx, msg).await
        }
        PeerSelection::NameNotConnected(name) => {
            trace!("no peer named {} connected", name);
            requeue_bounded(ctx, msg).await
        }
        PeerSelection::NoneRoutable => {
            trace!("no routable peer without a name");
            requeue_bounded(ctx, msg).await
        }
        PeerSelection::NamedGroupFull(name) => {
            debug!("all peers named {} are at capacity", name);
            RouteOutcome::Rejected(msg, RouteFailure::CapacityExhausted)
        }
        PeerSelection::AllFull => {
            debug!("all peers are at capacity");
            RouteOutcome::Rejected(msg, RouteFailure::CapacityExhausted)
        }
    }
}

async fn requeue_bounded(ctx: &RouterContext, msg: DataMessage) -> RouteOutcome {
    if let Some(max) = ctx.config.max_queue_length {
        if ctx.inbound.len().await >= max {
            return RouteOutcome::Rejected(msg, RouteFailure::QueueFull);
        }
    }
    match ctx.inbound.push(msg).await {
        Ok(()) => RouteOutcome::Requeued,
        Err(msg) => RouteOutcome::Rejected(msg, RouteFailure::ShuttingDown),
    }
}

/// Routes messages from the inbound queue until the queue is closed and empty.
///
/// Messages that can not be routed go back to the end of the queue, even once the queue is
///  closed, so during shutdown the dispatcher only finishes early when the router is dead.
///  After a pass over the queue without routing a single message, the dispatcher backs off
///  until either the back-off interval passes or the routing options change (a peer connects,
///  identifies or disconnects). Once done, it closes every message peer's outgoing queue so that the
///  senders send their final notice.
#[instrument(name = "dispatcher", skip_all)]
pub async fn run_dispatcher<R: Random>(ctx: Arc<RouterContext>) {
    let mut remaining_in_pass = ctx.inbound.len().await;
    let mut progress_in_pass = false;

    loop {
        if remaining_in_pass == 0 {
            if !progress_in_pass && !ctx.inbound.is_empty().await {
                if ctx.shutdown.phase() == Phase::Dead {
                    info!("router is dead, leaving {} messages unrouted", ctx.inbound.len().await);
                    break;
                }
                trace!("no progress in the last pass, backing off");
                select! {
                    _ = sleep(ctx.config.dispatcher_idle_backoff) => {}
                    _ = ctx.dispatcher_wakeup.notified() => {}
                    _ = ctx.shutdown.wait_for(Phase::Dead) => {}
                }
            }
            remaining_in_pass = ctx.inbound.len().await.max(1);
            progress_in_pass = false;
        }

        ctx.shutdown.wait_while_suspended().await;

        let msg = match ctx.inbound.pop().await {
            Some(msg) => msg,
            None => break,
        };
        remaining_in_pass -= 1;

        match route_incoming::<R>(&ctx, msg).await {
            RouteOutcome::Routed(_) => progress_in_pass = true,
            RouteOutcome::Requeued => {}
            RouteOutcome::Rejected(msg, failure) => {
                // the message was accepted from the carrier layer already, so it keeps waiting
                //  for a peer even after the queue was closed
                trace!("message {} can not be routed right now: {:?}", msg.id, failure);
                ctx.inbound.requeue(msg).await;
            }
        }
    }

    ctx.set_routing_done(PeerClass::Message);
    for conn in ctx.routing.message_peers().await {
        conn.outgoing().close().await;
    }
    if !ctx.inbound.is_empty().await {
        warn!("dispatcher finished with {} messages in the inbound queue", ctx.inbound.len().await);
    }
    debug!("dispatcher finished");
}
