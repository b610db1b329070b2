use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn, Instrument};

use crate::peer::connection::{PeerClass, PeerConnection};
use crate::peer::listener::BoxedStream;
use crate::peer::receiver::run_receiver;
use crate::peer::sender::run_sender;
use crate::router::context::RouterContext;


/// Serves a peer connection for its whole lifetime.
///
/// The connection is registered for routing, and its sender and receiver run until the
///  receiver finishes. Teardown then hands everything the connection still holds back for
///  another routing attempt: messages waiting for an acknowledgment first, then messages that
///  were never sent.
#[instrument(name = "connection", skip_all, fields(addr = %addr))]
pub async fn run_connection(ctx: Arc<RouterContext>, class: PeerClass, stream: BoxedStream, addr: SocketAddr) {
    let (reader, writer) = tokio::io::split(stream);
    let conn = Arc::new(PeerConnection::new(class, addr, Box::new(writer), ctx.config.max_pending_acks));
    debug!("connection {} is a {:?} peer", conn.id(), class);

    ctx.routing.register(conn.clone()).await;
    if ctx.is_routing_done(class) {
        // nobody is going to route messages to this connection anymore
        conn.outgoing().close().await;
    }

    let sender = tokio::spawn(run_sender(conn.clone(), ctx.clone()).in_current_span());
    run_receiver(conn.clone(), reader, ctx.clone()).await;

    conn.mark_dead();
    ctx.routing.deregister(&conn).await;
    conn.outgoing().close().await;
    conn.pending().close();
    if let Err(e) = sender.await {
        warn!("sender task failed: {}", e);
    }

    let pending = conn.pending().drain().await;
    let unsent = conn.outgoing().drain().await;
    if !pending.is_empty() || !unsent.is_empty() {
        info!("handing back {} unacknowledged and {} unsent messages of disconnected peer", pending.len(), unsent.len());
    }
    for msg in pending {
        ctx.requeue_or_fail(msg).await;
    }
    for msg in unsent {
        ctx.retry(msg).await;
    }

    ctx.dispatcher_wakeup.notify_one();
    info!("peer disconnected after {:?}", conn.uptime());
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::carrier::FailureReason;
    use crate::config::RouterConfig;
    use crate::framing::{read_frame, write_message};
    use crate::message::{AckOutcome, AdminCommand, DataMessage, Message};
    use crate::routing::routing_table::RoutingRules;
    use crate::test_util::carrier::TrackingCarrier;

    fn context(carrier: Arc<TrackingCarrier>) -> Arc<RouterContext> {
        Arc::new(RouterContext::new(RouterConfig::new(), RoutingRules::default(), carrier))
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    async fn read_message(peer: &mut DuplexStream) -> Option<Message> {
        read_frame(peer, 1024*1024).await.unwrap()
            .map(|frame| Message::deser(&frame).unwrap())
    }

    async fn wait_for_registration(ctx: &RouterContext) -> Arc<PeerConnection> {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(conn) = ctx.routing.message_peers().await.pop() {
                    return conn;
                }
                sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap()
    }

    #[tokio::test]
    async fn test_disconnect_hands_back_pending_and_unsent_messages() {
        let carrier = Arc::new(TrackingCarrier::new());
        let ctx = context(carrier.clone());
        let (router_side, mut peer) = tokio::io::duplex(64*1024);
        let task = tokio::spawn(run_connection(ctx.clone(), PeerClass::Message, Box::new(router_side), addr()));

        let conn = wait_for_registration(&ctx).await;
        let acked = DataMessage::new("1", "700", "a");
        let unacked = DataMessage::new("1", "700", "b");
        conn.enqueue_data(acked.clone()).await.unwrap();
        conn.enqueue_data(unacked.clone()).await.unwrap();

        assert_eq!(read_message(&mut peer).await, Some(Message::Data(acked.clone())));
        assert_eq!(read_message(&mut peer).await, Some(Message::Data(unacked.clone())));
        write_message(&mut peer, &Message::ack_for(&acked, AckOutcome::Success)).await.unwrap();
        carrier.wait_for_finalized(1).await;

        peer.shutdown().await.unwrap();
        drop(peer);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(carrier.sent().await, vec![acked]);
        assert_eq!(ctx.inbound.drain().await, vec![unacked]);
        assert!(ctx.routing.message_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_leftovers_fail_once_inbound_is_closed() {
        let carrier = Arc::new(TrackingCarrier::new());
        let ctx = context(carrier.clone());
        ctx.inbound.close().await;

        let (router_side, mut peer) = tokio::io::duplex(64*1024);
        let task = tokio::spawn(run_connection(ctx.clone(), PeerClass::Message, Box::new(router_side), addr()));

        let conn = wait_for_registration(&ctx).await;
        let msg = DataMessage::new("1", "700", "a");
        conn.enqueue_data(msg.clone()).await.unwrap();
        assert_eq!(read_message(&mut peer).await, Some(Message::Data(msg.clone())));

        drop(peer);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(carrier.failed().await, vec![(msg, FailureReason::Shutdown)]);
    }

    #[tokio::test]
    async fn test_late_connection_gets_final_notice() {
        let ctx = context(Arc::new(TrackingCarrier::new()));
        ctx.set_routing_done(PeerClass::Message);

        let (router_side, mut peer) = tokio::io::duplex(64*1024);
        let task = tokio::spawn(run_connection(ctx.clone(), PeerClass::Message, Box::new(router_side), addr()));

        assert_eq!(read_message(&mut peer).await, Some(Message::admin(AdminCommand::Shutdown)));
        drop(peer);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
