use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use crate::carrier::FailureReason;
use crate::framing::encode_message;
use crate::message::Message;
use crate::peer::connection::{PeerConnection, PendingInsert};
use crate::router::context::RouterContext;


/// Sends the messages in a connection's outgoing queue to the peer.
///
/// Data messages are recorded as pending before they are written, which waits while the peer
///  has too many unacknowledged messages. When the outgoing queue is closed and empty, the peer
///  is told to shut down (or restart), and the sender finishes. If writing to the peer fails,
///  the connection is marked dead so that nothing is routed to it anymore, the message goes
///  back for another routing attempt, and the sender finishes as well.
#[instrument(name = "sender", skip_all, fields(conn = conn.id(), addr = %conn.addr()))]
pub async fn run_sender(conn: Arc<PeerConnection>, ctx: Arc<RouterContext>) {
    while conn.is_alive() {
        ctx.shutdown.wait_while_suspended().await;

        let msg = match conn.outgoing().pop().await {
            Some(msg) => msg,
            None => {
                let command = ctx.final_admin_command();
                debug!("no more messages for this peer, sending {:?}", command);
                if let Err(e) = conn.send_message(&Message::admin(command)).await {
                    debug!("failed to send {:?} to peer: {}", command, e);
                }
                break;
            }
        };

        if !send(&conn, msg, &ctx).await {
            break;
        }
    }
    debug!("sender finished");
}

/// returns false if the connection can not be used for sending anymore, in which case it is
///  marked dead before the message is handed back
async fn send(conn: &PeerConnection, msg: Message, ctx: &RouterContext) -> bool {
    if let Message::Heartbeat(_) = msg {
        trace!("caught a heartbeat - we are alive");
        return true;
    }

    if !conn.is_alive() {
        ctx.retry(msg).await;
        return false;
    }

    let payload = encode_message(&msg);
    match msg {
        Message::Data(data) => {
            let id = data.id;
            match conn.pending().record_sent(data).await {
                PendingInsert::Recorded => {}
                PendingInsert::AlreadyPending(data) => {
                    // the peer has this message already, and its acknowledgment finalizes the
                    //  pending entry, so this copy can not be tracked
                    ctx.carrier.on_send_failed(data, FailureReason::Undeliverable).await;
                    return true;
                }
                PendingInsert::Closed(data) => {
                    ctx.requeue_or_fail(data).await;
                    return false;
                }
            }

            if let Err(e) = conn.send_frame(&payload).await {
                warn!("failed to send message {} to peer: {}", id, e);
                conn.mark_dead();
                if let Some(data) = conn.pending().record_ack(&id).await {
                    ctx.requeue_or_fail(data).await;
                }
                return false;
            }
            trace!("sent message {}", id);
            true
        }
        other => {
            if let Err(e) = conn.send_frame(&payload).await {
                warn!("failed to send {:?} message to peer: {}", other.kind(), e);
                conn.mark_dead();
                ctx.retry(other).await;
                return false;
            }
            true
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{AsyncWrite, DuplexStream};
    use tokio::time::timeout;

    use super::*;
    use crate::config::RouterConfig;
    use crate::framing::read_frame;
    use crate::message::{AdminCommand, DataMessage, DatagramMessage, HeartbeatMessage};
    use crate::peer::connection::PeerClass;
    use crate::routing::dispatcher::{route_incoming, RouteOutcome};
    use crate::routing::routing_table::RoutingRules;
    use crate::test_util::carrier::TrackingCarrier;
    use crate::util::random::RngRandom;

    struct FailingWriter;
    impl AsyncWrite for FailingWriter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn context(carrier: Arc<TrackingCarrier>, restart: bool) -> Arc<RouterContext> {
        let mut config = RouterConfig::new();
        config.restart = restart;
        Arc::new(RouterContext::new(config, RoutingRules::default(), carrier))
    }

    fn connection(class: PeerClass) -> (Arc<PeerConnection>, DuplexStream) {
        let (writer, peer_in) = tokio::io::duplex(64*1024);
        let conn = Arc::new(PeerConnection::new(class, SocketAddr::from(([127, 0, 0, 1], 9000)), Box::new(writer), 3));
        (conn, peer_in)
    }

    async fn read_message(peer_in: &mut DuplexStream) -> Message {
        let frame = read_frame(peer_in, 1024*1024).await.unwrap().unwrap();
        Message::deser(&frame).unwrap()
    }

    #[rstest::rstest]
    #[case::shutdown(false, AdminCommand::Shutdown)]
    #[case::restart(true, AdminCommand::Restart)]
    #[tokio::test]
    async fn test_sends_queued_messages_then_final_notice(#[case] restart: bool, #[case] expected_command: AdminCommand) {
        let ctx = context(Arc::new(TrackingCarrier::new()), restart);
        let (conn, mut peer_in) = connection(PeerClass::Message);

        let first = DataMessage::new("1", "700", "a");
        let second = DataMessage::new("1", "700", "b");
        conn.enqueue_data(first.clone()).await.unwrap();
        conn.outgoing().push(Message::Heartbeat(HeartbeatMessage { load: 0 })).await.unwrap();
        conn.enqueue_data(second.clone()).await.unwrap();
        conn.outgoing().close().await;

        timeout(Duration::from_secs(5), run_sender(conn.clone(), ctx)).await.unwrap();

        assert_eq!(read_message(&mut peer_in).await, Message::Data(first));
        assert_eq!(read_message(&mut peer_in).await, Message::Data(second));
        assert_eq!(read_message(&mut peer_in).await, Message::admin(expected_command));
        assert_eq!(conn.pending().len().await, 2);
    }

    #[tokio::test]
    async fn test_datagrams_are_not_tracked() {
        let ctx = context(Arc::new(TrackingCarrier::new()), false);
        let (conn, mut peer_in) = connection(PeerClass::Datagram);

        let datagram = DatagramMessage::new("10.0.0.1", 1, "10.0.0.2", 2, "x");
        conn.outgoing().push(Message::Datagram(datagram.clone())).await.unwrap();
        conn.outgoing().close().await;

        timeout(Duration::from_secs(5), run_sender(conn.clone(), ctx)).await.unwrap();
        assert_eq!(read_message(&mut peer_in).await, Message::Datagram(datagram));
        assert!(conn.pending().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_pending_capacity() {
        let ctx = context(Arc::new(TrackingCarrier::new()), false);
        let (conn, mut peer_in) = connection(PeerClass::Message);

        let messages: Vec<DataMessage> = (0..4)
            .map(|i| DataMessage::new("1", "700", i.to_string()))
            .collect();
        for msg in &messages {
            conn.enqueue_data(msg.clone()).await.unwrap();
        }

        let sender = tokio::spawn(run_sender(conn.clone(), ctx));
        for msg in &messages[..3] {
            assert_eq!(read_message(&mut peer_in).await, Message::Data(msg.clone()));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(conn.pending().len().await, 3);
        assert!(!sender.is_finished());

        conn.pending().record_ack(&messages[0].id).await.unwrap();
        assert_eq!(read_message(&mut peer_in).await, Message::Data(messages[3].clone()));

        conn.outgoing().close().await;
        timeout(Duration::from_secs(1), sender).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_requeues_message() {
        let ctx = context(Arc::new(TrackingCarrier::new()), false);
        let conn = Arc::new(PeerConnection::new(PeerClass::Message, SocketAddr::from(([127, 0, 0, 1], 9000)), Box::new(FailingWriter), 3));
        conn.set_routable(true);

        let msg = DataMessage::new("1", "700", "a");
        conn.enqueue_data(msg.clone()).await.unwrap();

        timeout(Duration::from_secs(5), run_sender(conn.clone(), ctx.clone())).await.unwrap();

        assert!(conn.pending().is_empty().await);
        assert!(!conn.is_alive());
        assert_eq!(ctx.inbound.drain().await, vec![msg]);
    }

    #[tokio::test]
    async fn test_messages_are_not_routed_to_connection_after_write_failure() {
        let ctx = context(Arc::new(TrackingCarrier::new()), false);
        let conn = Arc::new(PeerConnection::new(PeerClass::Message, SocketAddr::from(([127, 0, 0, 1], 9000)), Box::new(FailingWriter), 3));
        ctx.routing.register(conn.clone()).await;
        ctx.routing.identify(&conn, "shopA".to_string()).await;
        conn.enqueue_data(DataMessage::new("1", "700", "a").with_sticky_name("shopA")).await.unwrap();

        timeout(Duration::from_secs(5), run_sender(conn.clone(), ctx.clone())).await.unwrap();

        let msg = ctx.inbound.try_pop().await.unwrap();
        let outcome = route_incoming::<RngRandom>(&ctx, msg).await;
        assert!(matches!(outcome, RouteOutcome::Requeued));
        assert!(conn.outgoing().is_empty().await);
        assert_eq!(ctx.inbound.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_reported_as_undeliverable() {
        let carrier = Arc::new(TrackingCarrier::new());
        let ctx = context(carrier.clone(), false);
        let (conn, mut peer_in) = connection(PeerClass::Message);

        let msg = DataMessage::new("1", "700", "a");
        conn.enqueue_data(msg.clone()).await.unwrap();
        conn.enqueue_data(msg.clone()).await.unwrap();
        conn.outgoing().close().await;

        timeout(Duration::from_secs(5), run_sender(conn.clone(), ctx)).await.unwrap();

        assert_eq!(read_message(&mut peer_in).await, Message::Data(msg.clone()));
        assert_eq!(read_message(&mut peer_in).await, Message::admin(AdminCommand::Shutdown));
        assert_eq!(conn.pending().len().await, 1);
        assert_eq!(carrier.failed().await, vec![(msg, FailureReason::Undeliverable)]);
    }

    #[tokio::test]
    async fn test_dead_connection_hands_back_message() {
        let carrier = Arc::new(TrackingCarrier::new());
        let ctx = context(carrier.clone(), false);
        let (conn, _peer_in) = connection(PeerClass::Message);
        ctx.inbound.close().await;

        let msg = DataMessage::new("1", "700", "a");
        conn.enqueue_data(msg.clone()).await.unwrap();
        conn.mark_dead();
        conn.outgoing().close().await;

        // a dead connection's sender does not even start
        timeout(Duration::from_secs(5), run_sender(conn.clone(), ctx.clone())).await.unwrap();
        assert_eq!(conn.outgoing().len().await, 1);

        assert!(!send(&conn, conn.outgoing().try_pop().await.unwrap(), &ctx).await);
        assert_eq!(carrier.failed().await, vec![(msg, FailureReason::Shutdown)]);
    }
}
