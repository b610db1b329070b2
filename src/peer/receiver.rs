use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::select;
use tracing::{debug, instrument, trace, warn};

use crate::carrier::FailureReason;
use crate::framing::read_frame;
use crate::message::{AckMessage, AckOutcome, AdminCommand, AdminMessage, DataMessage, DatagramMessage, Message};
use crate::peer::connection::{PeerClass, PeerConnection};
use crate::router::context::RouterContext;
use crate::shutdown::Phase;

enum ReadOutcome {
    Message(Message),
    /// a frame that could not be parsed
    Garbage,
    Closed,
}

/// Reads messages from a peer until the peer closes the connection, reading fails, or either
///  the connection or the router is dead
#[instrument(name = "receiver", skip_all, fields(conn = conn.id(), addr = %conn.addr()))]
pub async fn run_receiver<R: AsyncRead + Unpin>(conn: Arc<PeerConnection>, reader: R, ctx: Arc<RouterContext>) {
    let mut reader = BufReader::new(reader);

    while conn.is_alive() && ctx.shutdown.phase() != Phase::Dead {
        ctx.shutdown.wait_while_suspended().await;

        match read_message(&conn, &mut reader, &ctx).await {
            ReadOutcome::Message(msg) => on_message(&conn, msg, &ctx).await,
            ReadOutcome::Garbage => {}
            ReadOutcome::Closed => {
                conn.mark_dead();
            }
        }
    }
    debug!("receiver finished");
}

async fn read_message<R: AsyncRead + Unpin>(conn: &PeerConnection, reader: &mut BufReader<R>, ctx: &RouterContext) -> ReadOutcome {
    // Waiting for the start of a frame does not consume anything, so it is safe to abandon it
    //  when the router or the connection dies. Once a frame started arriving, it is read
    //  completely.
    let has_data = select! {
        filled = async { reader.fill_buf().await.map(|buf| !buf.is_empty()) } => match filled {
            Ok(has_data) => has_data,
            Err(e) => {
                debug!("error reading from peer: {}", e);
                return ReadOutcome::Closed;
            }
        },
        _ = ctx.shutdown.wait_for(Phase::Dead) => {
            debug!("router is dead, no longer waiting for messages");
            return ReadOutcome::Closed;
        }
        _ = conn.wait_dead() => {
            debug!("connection is dead, no longer waiting for messages");
            return ReadOutcome::Closed;
        }
    };
    if !has_data {
        debug!("peer closed the connection");
        return ReadOutcome::Closed;
    }

    let frame = match read_frame(reader, ctx.config.max_frame_len).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return ReadOutcome::Closed,
        Err(e) => {
            warn!("error reading message from peer: {}", e);
            return ReadOutcome::Closed;
        }
    };

    match Message::deser(&frame) {
        Ok(msg) => ReadOutcome::Message(msg),
        Err(e) => {
            warn!("dropping unparseable message from peer: {}", e);
            ReadOutcome::Garbage
        }
    }
}

async fn on_message(conn: &Arc<PeerConnection>, msg: Message, ctx: &RouterContext) {
    trace!("received {:?} message", msg.kind());

    match msg {
        Message::Data(data) => on_data(conn, data, ctx).await,
        Message::Datagram(datagram) => on_datagram(conn, datagram, ctx).await,
        Message::Ack(ack) => on_ack(conn, ack, ctx).await,
        Message::Admin(AdminMessage { command: AdminCommand::Identify, sticky_name }) => on_identify(conn, sticky_name, ctx).await,
        Message::Admin(admin) => warn!("unexpected admin command {:?} from peer - ignoring", admin.command),
        Message::Heartbeat(heartbeat) => {
            if heartbeat.load != conn.load() {
                debug!("load factor now {}", heartbeat.load);
            }
            conn.set_load(heartbeat.load);
        }
    }
}

async fn on_data(conn: &Arc<PeerConnection>, data: DataMessage, ctx: &RouterContext) {
    if ctx.shutdown.is_terminating() {
        debug!("rejecting message {} while shutting down", data.id);
        send_ack(conn, Message::ack_for(&data, AckOutcome::FailedTemporarily)).await;
        return;
    }

    if !conn.is_routable() {
        conn.set_routable(true);
        ctx.dispatcher_wakeup.notify_one();
    }

    let id = data.id;
    let outcome = ctx.carrier.submit(data).await;
    trace!("carrier layer answered {:?} for message {}", outcome, id);
    send_ack(conn, Message::Ack(AckMessage { id, outcome: outcome.ack_outcome() })).await;
}

async fn on_datagram(conn: &PeerConnection, datagram: DatagramMessage, ctx: &RouterContext) {
    if conn.class() != PeerClass::Datagram {
        warn!("message peer sent a datagram - ignoring");
        return;
    }
    if let Err(datagram) = ctx.outgoing_datagrams.push(datagram).await {
        warn!("discarding datagram to {}:{} during shutdown", datagram.destination_address, datagram.destination_port);
    }
}

async fn on_ack(conn: &PeerConnection, ack: AckMessage, ctx: &RouterContext) {
    let msg = match conn.pending().record_ack(&ack.id).await {
        Some(msg) => msg,
        None => {
            warn!("got acknowledgment for message {} which is not pending", ack.id);
            return;
        }
    };

    match ack.outcome {
        AckOutcome::Success | AckOutcome::Queued => {
            trace!("message {} acknowledged as {:?}", ack.id, ack.outcome);
            ctx.carrier.on_sent(msg).await;
        }
        AckOutcome::Rejected => {
            debug!("peer rejected message {}", ack.id);
            ctx.carrier.on_send_failed(msg, FailureReason::Rejected).await;
        }
        AckOutcome::FailedTemporarily => {
            debug!("peer failed to handle message {} temporarily, queueing it for another attempt", ack.id);
            ctx.requeue_or_fail(msg).await;
        }
    }
}

async fn on_identify(conn: &Arc<PeerConnection>, sticky_name: Option<String>, ctx: &RouterContext) {
    if conn.class() != PeerClass::Message {
        warn!("datagram peer sent an identification - ignoring");
        return;
    }

    match sticky_name {
        Some(name) if !name.is_empty() => {
            ctx.routing.identify(conn, name).await;
        }
        _ => debug!("identification without a name"),
    }
    conn.set_routable(true);
    ctx.dispatcher_wakeup.notify_one();
}

async fn send_ack(conn: &PeerConnection, ack: Message) {
    if let Err(e) = conn.send_message(&ack).await {
        debug!("failed to send acknowledgment to peer: {}", e);
    }
}
