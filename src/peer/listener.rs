use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

use crate::config::ListenerConfig;
use crate::peer::connection::PeerClass;
use crate::peer::ip_filter::IpFilter;
use crate::router::connection_task::run_connection;
use crate::router::context::RouterContext;
use crate::shutdown::Phase;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Wraps accepted sockets for listeners that are configured for TLS
#[async_trait]
pub trait StreamUpgrade: Send + Sync + 'static {
    async fn upgrade(&self, stream: TcpStream) -> anyhow::Result<BoxedStream>;
}

/// Accepts connections from one class of peers
pub struct Listener {
    class: PeerClass,
    socket: TcpListener,
    ip_filter: Arc<IpFilter>,
    upgrade: Option<Arc<dyn StreamUpgrade>>,
    ctx: Arc<RouterContext>,
}

impl Listener {
    pub async fn bind(class: PeerClass, config: &ListenerConfig, ip_filter: Arc<IpFilter>, upgrade: Option<Arc<dyn StreamUpgrade>>, ctx: Arc<RouterContext>) -> anyhow::Result<Listener> {
        let socket = TcpListener::bind(config.bind_addr).await
            .map_err(|e| anyhow!("failed to open {:?} peer port {}: {}", class, config.bind_addr, e))?;
        info!("listening for {:?} peers on {}{}", class, socket.local_addr()?, if config.tls { " using TLS" } else { "" });

        Ok(Listener {
            class,
            socket,
            ip_filter,
            upgrade: if config.tls { upgrade } else { None },
            ctx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn num_waiting_messages(&self) -> usize {
        match self.class {
            PeerClass::Message => self.ctx.inbound.len().await,
            PeerClass::Datagram => self.ctx.inbound_datagrams.len().await,
        }
    }

    /// Accepts connections until the router shuts down. While draining, connections are still
    ///  accepted as long as there are messages waiting for a peer, but only for the configured
    ///  grace period.
    #[instrument(name = "listener", skip_all, fields(class = ?self.class))]
    pub async fn run(self) {
        let mut drain_deadline: Option<Instant> = None;

        loop {
            match self.ctx.shutdown.phase() {
                Phase::Running => {}
                Phase::Draining => {
                    let deadline = *drain_deadline.get_or_insert_with(|| Instant::now() + self.ctx.config.shutdown_grace_period);
                    let num_waiting = self.num_waiting_messages().await;
                    if num_waiting == 0 {
                        info!("no more messages waiting, no longer accepting connections");
                        break;
                    }
                    if Instant::now() >= deadline {
                        info!("still {} messages waiting after the grace period, no longer accepting connections", num_waiting);
                        break;
                    }
                    debug!("{} messages waiting, accepting connections while draining", num_waiting);
                }
                Phase::Dead => break,
            }

            self.ctx.shutdown.wait_while_suspended().await;

            select! {
                accepted = self.socket.accept() => match accepted {
                    Ok((stream, addr)) => self.on_accepted(stream, addr),
                    Err(e) => error!("error accepting connection: {}", e),
                },
                _ = sleep(self.ctx.config.listener_poll_interval) => {}
                _ = self.ctx.shutdown.wait_for(Phase::Dead) => {}
            }
        }
        debug!("listener finished");
    }

    fn on_accepted(&self, stream: TcpStream, addr: SocketAddr) {
        if !self.ip_filter.is_allowed(addr.ip()) {
            info!("connection attempt from denied host {}, disconnected", addr.ip());
            return;
        }
        info!("peer connected from {}", addr);

        let active = self.ctx.track_connection();
        let ctx = self.ctx.clone();
        let class = self.class;
        let upgrade = self.upgrade.clone();

        tokio::spawn(async move {
            let _active = active;
            let stream: BoxedStream = match upgrade {
                Some(upgrade) => match upgrade.upgrade(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("failed to upgrade connection from {}: {}", addr, e);
                        return;
                    }
                },
                None => Box::new(stream),
            };
            run_connection(ctx, class, stream, addr).await;
        }.instrument(Span::current()));
    }
}
