use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, trace, warn};

use crate::carrier::{CarrierLayer, FailureReason};
use crate::config::RouterConfig;
use crate::message::{AdminCommand, DataMessage, DatagramMessage, Message};
use crate::peer::connection::PeerClass;
use crate::queue::MessageQueue;
use crate::routing::routing_table::{RoutingRules, RoutingTable};
use crate::shutdown::ShutdownContext;


/// State shared by all of the router's tasks
pub struct RouterContext {
    pub config: RouterConfig,
    pub carrier: Arc<dyn CarrierLayer>,
    pub routing: RoutingTable,
    pub shutdown: ShutdownContext,

    /// data messages from carriers waiting to be dispatched to a peer, including messages
    ///  coming back from peers for another attempt
    pub inbound: MessageQueue<DataMessage>,
    /// datagrams from carriers waiting to be routed to a datagram peer
    pub inbound_datagrams: MessageQueue<DatagramMessage>,
    /// datagrams from datagram peers waiting to be passed to the carrier layer
    pub outgoing_datagrams: MessageQueue<DatagramMessage>,

    /// wakes the dispatcher when routing options changed, e.g. because a peer identified
    pub dispatcher_wakeup: Notify,
    message_routing_done: AtomicBool,
    datagram_routing_done: AtomicBool,

    restart: AtomicBool,
    active_connections: watch::Sender<usize>,

    carriers: RwLock<BTreeSet<String>>,
    sent_to_carrier: AtomicU64,
    failed_to_carrier: AtomicU64,
}

impl RouterContext {
    pub fn new(config: RouterConfig, rules: RoutingRules, carrier: Arc<dyn CarrierLayer>) -> RouterContext {
        let restart = config.restart;
        let (active_connections, _) = watch::channel(0);
        RouterContext {
            config,
            carrier,
            routing: RoutingTable::new(rules),
            shutdown: ShutdownContext::new(),
            inbound: MessageQueue::new(),
            inbound_datagrams: MessageQueue::new(),
            outgoing_datagrams: MessageQueue::new(),
            dispatcher_wakeup: Notify::new(),
            message_routing_done: AtomicBool::new(false),
            datagram_routing_done: AtomicBool::new(false),
            restart: AtomicBool::new(restart),
            active_connections,
            carriers: Default::default(),
            sent_to_carrier: AtomicU64::new(0),
            failed_to_carrier: AtomicU64::new(0),
        }
    }

    /// Hands a data message back for another routing attempt. Once the inbound queue is closed,
    ///  that is no longer possible, and the message is reported to the carrier layer as failed.
    pub async fn requeue_or_fail(&self, msg: DataMessage) {
        if let Err(msg) = self.inbound.push(msg).await {
            debug!("inbound queue is closed, reporting message {} as failed", msg.id);
            self.carrier.on_send_failed(msg, FailureReason::Shutdown).await;
        }
    }

    pub async fn requeue_datagram(&self, msg: DatagramMessage) {
        if let Err(msg) = self.inbound_datagrams.push(msg).await {
            warn!("discarding datagram from {}:{} during shutdown", msg.source_address, msg.source_port);
        }
    }

    /// Hands back a message that was queued for a peer but not delivered
    pub async fn retry(&self, msg: Message) {
        match msg {
            Message::Data(data) => self.requeue_or_fail(data).await,
            Message::Datagram(datagram) => self.requeue_datagram(datagram).await,
            other => trace!("dropping undelivered {:?} message", other.kind()),
        }
    }

    pub fn set_restart(&self, restart: bool) {
        self.restart.store(restart, Ordering::Release);
    }

    /// the command that senders send to their peers when there is nothing left to send
    pub fn final_admin_command(&self) -> AdminCommand {
        if self.restart.load(Ordering::Acquire) {
            AdminCommand::Restart
        }
        else {
            AdminCommand::Shutdown
        }
    }

    /// Marks the end of routing to the given class of peers: whoever registers a connection
    ///  after this must close its outgoing queue themselves
    pub fn set_routing_done(&self, class: PeerClass) {
        match class {
            PeerClass::Message => self.message_routing_done.store(true, Ordering::SeqCst),
            PeerClass::Datagram => self.datagram_routing_done.store(true, Ordering::SeqCst),
        }
    }

    pub fn is_routing_done(&self, class: PeerClass) -> bool {
        match class {
            PeerClass::Message => self.message_routing_done.load(Ordering::SeqCst),
            PeerClass::Datagram => self.datagram_routing_done.load(Ordering::SeqCst),
        }
    }

    /// Counts a connection as active until the returned guard is dropped
    pub fn track_connection(self: &Arc<Self>) -> ActiveConnection {
        self.active_connections.send_modify(|n| *n += 1);
        ActiveConnection {
            ctx: self.clone(),
        }
    }

    pub fn num_active_connections(&self) -> usize {
        *self.active_connections.borrow()
    }

    /// Completes once no connection is active
    pub async fn wait_for_connections_closed(&self) {
        let mut receiver = self.active_connections.subscribe();
        let _ = receiver.wait_for(|n| *n == 0).await;
    }

    pub async fn add_carrier(&self, carrier_id: &str) -> bool {
        self.carriers.write().await
            .insert(carrier_id.to_string())
    }

    pub async fn remove_carrier(&self, carrier_id: &str) -> bool {
        self.carriers.write().await
            .remove(carrier_id)
    }

    pub async fn carriers(&self) -> Vec<String> {
        self.carriers.read().await
            .iter()
            .cloned()
            .collect()
    }

    pub fn count_sent_to_carrier(&self) {
        self.sent_to_carrier.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_failed_to_carrier(&self) {
        self.failed_to_carrier.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent_to_carrier(&self) -> u64 {
        self.sent_to_carrier.load(Ordering::Relaxed)
    }

    pub fn failed_to_carrier(&self) -> u64 {
        self.failed_to_carrier.load(Ordering::Relaxed)
    }
}

/// Keeps a connection counted as active for as long as it lives
pub struct ActiveConnection {
    ctx: Arc<RouterContext>,
}
impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.ctx.active_connections.send_modify(|n| *n -= 1);
    }
}
