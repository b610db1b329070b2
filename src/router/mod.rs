pub mod connection_task;
pub mod context;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

use crate::carrier::{CarrierLayer, FailureReason, SubmitOutcome};
use crate::config::RouterConfig;
use crate::message::{DataMessage, DatagramMessage, Message};
use crate::peer::connection::PeerClass;
use crate::peer::ip_filter::IpFilter;
use crate::peer::listener::{Listener, StreamUpgrade};
use crate::router::context::RouterContext;
use crate::routing::datagram_router::{run_datagram_forwarder, run_datagram_router};
use crate::routing::dispatcher::{route_incoming, run_dispatcher, RouteFailure, RouteOutcome};
use crate::routing::routing_table::RoutingRules;
use crate::shutdown::{Phase, ShutdownMode};
use crate::status::{ConnectionStatus, RouterStatus};
use crate::util::random::RngRandom;


struct RouterTasks {
    listeners: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<()>,
    datagram_router: JoinHandle<()>,
    datagram_forwarder: JoinHandle<()>,
}

/// The router's public face: carrier layer callbacks and administration.
///
/// A router is started once and shut down once. All of its work is done by background tasks
///  that are spawned on start: a listener per configured peer class, the dispatcher for data
///  messages, the datagram router, and the forwarder passing datagrams to the carrier layer.
pub struct Router {
    ctx: Arc<RouterContext>,
    message_addr: Option<SocketAddr>,
    datagram_addr: Option<SocketAddr>,
    tasks: Mutex<Option<RouterTasks>>,
}

impl Router {
    pub async fn start(config: RouterConfig, carrier: Arc<dyn CarrierLayer>) -> anyhow::Result<Arc<Router>> {
        Self::start_with_upgrade(config, carrier, None).await
    }

    /// Starts a router that uses `upgrade` to set up TLS on listeners that require it
    pub async fn start_with_upgrade(config: RouterConfig, carrier: Arc<dyn CarrierLayer>, upgrade: Option<Arc<dyn StreamUpgrade>>) -> anyhow::Result<Arc<Router>> {
        config.validate(upgrade.is_some())?;
        let rules = RoutingRules::from_config(&config.routes)?;
        let ip_filter = Arc::new(IpFilter::new(&config.allow_ip, &config.deny_ip));

        let message_listener_config = config.message_listener.clone();
        let datagram_listener_config = config.datagram_listener.clone();
        let ctx = Arc::new(RouterContext::new(config, rules, carrier));

        let mut listeners = Vec::new();
        let mut message_addr = None;
        let mut datagram_addr = None;
        if let Some(listener_config) = &message_listener_config {
            let listener = Listener::bind(PeerClass::Message, listener_config, ip_filter.clone(), upgrade.clone(), ctx.clone()).await?;
            message_addr = Some(listener.local_addr()?);
            listeners.push(listener);
        }
        if let Some(listener_config) = &datagram_listener_config {
            let listener = Listener::bind(PeerClass::Datagram, listener_config, ip_filter.clone(), upgrade.clone(), ctx.clone()).await?;
            datagram_addr = Some(listener.local_addr()?);
            listeners.push(listener);
        }

        let tasks = RouterTasks {
            listeners: listeners.into_iter()
                .map(|listener| tokio::spawn(listener.run()))
                .collect(),
            dispatcher: tokio::spawn(run_dispatcher::<RngRandom>(ctx.clone()).in_current_span()),
            datagram_router: tokio::spawn(run_datagram_router::<RngRandom>(ctx.clone()).in_current_span()),
            datagram_forwarder: tokio::spawn(run_datagram_forwarder(ctx.clone()).in_current_span()),
        };
        info!("router started");

        Ok(Arc::new(Router {
            ctx,
            message_addr,
            datagram_addr,
            tasks: Mutex::new(Some(tasks)),
        }))
    }

    pub fn local_addr(&self, class: PeerClass) -> Option<SocketAddr> {
        match class {
            PeerClass::Message => self.message_addr,
            PeerClass::Datagram => self.datagram_addr,
        }
    }

    pub async fn on_connected(&self, carrier_id: &str) {
        if self.ctx.add_carrier(carrier_id).await {
            info!("carrier {} connected", carrier_id);
        }
    }

    pub async fn on_killed(&self, carrier_id: &str) {
        if self.ctx.remove_carrier(carrier_id).await {
            info!("carrier {} disconnected", carrier_id);
        }
    }

    /// Accepts a data message from a carrier for delivery to a peer
    pub async fn on_received(&self, carrier_id: &str, mut msg: DataMessage) -> SubmitOutcome {
        if msg.carrier_id.is_none() {
            msg.carrier_id = Some(carrier_id.to_string());
        }
        if self.ctx.shutdown.is_terminating() {
            debug!("rejecting message {} from carrier {} during shutdown", msg.id, carrier_id);
            return SubmitOutcome::RejectedNoRoute;
        }

        match route_incoming::<RngRandom>(&self.ctx, msg).await {
            RouteOutcome::Routed(_) => SubmitOutcome::Success,
            RouteOutcome::Requeued => SubmitOutcome::Queued,
            RouteOutcome::Rejected(msg, failure) => {
                debug!("rejecting message {} from carrier {}: {:?}", msg.id, carrier_id, failure);
                match failure {
                    RouteFailure::QueueFull | RouteFailure::CapacityExhausted => SubmitOutcome::RejectedQueueFull,
                    RouteFailure::ShuttingDown => SubmitOutcome::RejectedNoRoute,
                }
            }
        }
    }

    pub async fn on_datagram_received(&self, msg: DatagramMessage) {
        self.ctx.requeue_datagram(msg).await;
    }

    /// The carrier layer delivered a message that originated at a peer
    pub async fn on_sent(&self, carrier_id: &str, msg: DataMessage) {
        debug!("carrier {} delivered message {}", carrier_id, msg.id);
        self.ctx.count_sent_to_carrier();
    }

    pub async fn on_send_failed(&self, carrier_id: &str, msg: DataMessage, reason: FailureReason) {
        info!("carrier {} failed to deliver message {}: {:?}", carrier_id, msg.id, reason);
        self.ctx.count_failed_to_carrier();
    }

    pub fn suspend(&self) -> anyhow::Result<()> {
        self.ctx.shutdown.suspend()
    }

    pub fn resume(&self) -> anyhow::Result<()> {
        self.ctx.shutdown.resume()
    }

    pub async fn status(&self) -> RouterStatus {
        let mut connections = Vec::new();
        for (conn, name) in self.ctx.routing.connections().await {
            let pending_acks = conn.pending().len().await;
            connections.push(ConnectionStatus {
                id: conn.id(),
                class: conn.class(),
                name,
                address: conn.addr(),
                uptime: conn.uptime(),
                queue_depth: conn.outgoing().len().await + pending_acks,
                pending_acks,
                load: conn.load(),
                alive: conn.is_alive(),
                routable: conn.is_routable(),
            });
        }

        RouterStatus {
            phase: self.ctx.shutdown.phase(),
            suspended: self.ctx.shutdown.is_suspended(),
            connections,
            inbound_queue_len: self.ctx.inbound.len().await,
            inbound_datagram_queue_len: self.ctx.inbound_datagrams.len().await,
            datagram_peer_queue_len: self.ctx.outgoing_datagrams.len().await,
            carriers: self.ctx.carriers().await,
            sent_to_carrier: self.ctx.sent_to_carrier(),
            failed_to_carrier: self.ctx.failed_to_carrier(),
        }
    }

    /// Shuts down like [Router::shutdown], but asks peers to restart rather than shut down
    pub async fn restart(&self, mode: ShutdownMode) -> anyhow::Result<()> {
        self.ctx.set_restart(true);
        self.shutdown(mode).await
    }

    /// Stops the router, completing once all of its tasks finished.
    ///
    /// In [ShutdownMode::Drain], queued messages are still delivered to peers while the peers
    ///  stay connected, and listeners keep accepting connections for a grace period while
    ///  messages are waiting. In [ShutdownMode::FailAll], all queued messages are reported as
    ///  failed right away. Either way, every message that can not be delivered is reported to
    ///  the carrier layer as failed.
    pub async fn shutdown(&self, mode: ShutdownMode) -> anyhow::Result<()> {
        let tasks = match self.tasks.lock().await.take() {
            Some(tasks) => tasks,
            None => bail!("router is already shut down"),
        };
        info!("shutting down ({:?})", mode);
        self.ctx.shutdown.set_phase(Phase::Draining);
        let grace_period = self.ctx.config.shutdown_grace_period;

        if mode == ShutdownMode::FailAll {
            self.fail_all().await;
        }

        for listener in tasks.listeners {
            join("listener", listener).await;
        }

        self.ctx.inbound.close().await;
        self.ctx.inbound_datagrams.close().await;

        let mut dispatcher = tasks.dispatcher;
        if timeout(grace_period, &mut dispatcher).await.is_err() {
            info!("{} messages still waiting for a peer after the grace period", self.ctx.inbound.len().await);
            self.ctx.shutdown.set_phase(Phase::Dead);
            join("dispatcher", dispatcher).await;
        }
        join("datagram router", tasks.datagram_router).await;

        if timeout(grace_period, self.ctx.wait_for_connections_closed()).await.is_err() {
            info!("{} peers still connected after the grace period", self.ctx.num_active_connections());
        }
        self.ctx.shutdown.set_phase(Phase::Dead);
        if timeout(grace_period, self.ctx.wait_for_connections_closed()).await.is_err() {
            warn!("{} connections did not finish", self.ctx.num_active_connections());
        }

        for msg in self.ctx.inbound.drain().await {
            self.ctx.carrier.on_send_failed(msg, FailureReason::Shutdown).await;
        }

        self.ctx.outgoing_datagrams.close().await;
        join("datagram forwarder", tasks.datagram_forwarder).await;

        info!("router shut down");
        Ok(())
    }

    async fn fail_all(&self) {
        let mut num_failed = 0;
        for msg in self.ctx.inbound.drain().await {
            self.ctx.carrier.on_send_failed(msg, FailureReason::Shutdown).await;
            num_failed += 1;
        }
        let num_datagrams = self.ctx.inbound_datagrams.drain().await.len();

        for (conn, _) in self.ctx.routing.connections().await {
            for msg in conn.outgoing().drain().await {
                match msg {
                    Message::Data(data) => {
                        self.ctx.carrier.on_send_failed(data, FailureReason::Shutdown).await;
                        num_failed += 1;
                    }
                    Message::Datagram(_) => {
                        debug!("discarding queued datagram of connection {}", conn.id());
                    }
                    _ => {}
                }
            }
        }
        info!("failed {} queued messages, discarded {} datagrams", num_failed, num_datagrams);
    }
}

async fn join(task_name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!("{} task failed: {}", task_name, e);
    }
}
