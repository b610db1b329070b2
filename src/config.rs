use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::framing::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// accepted sockets are passed through the router's stream upgrade (i.e. TLS) before use
    pub tls: bool,
}
impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> ListenerConfig {
        ListenerConfig {
            bind_addr,
            tls: false,
        }
    }
}

/// A static routing rule: messages matching any of the carrier ids or shortcodes go to the
///  peer(s) that identified as `peer_name`. Lists are `;` separated.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub peer_name: String,
    pub carrier_ids: Option<String>,
    pub shortcodes: Option<String>,
}
impl RouteConfig {
    pub fn new(peer_name: impl Into<String>) -> RouteConfig {
        RouteConfig {
            peer_name: peer_name.into(),
            carrier_ids: None,
            shortcodes: None,
        }
    }

    pub fn with_carrier_ids(mut self, carrier_ids: impl Into<String>) -> RouteConfig {
        self.carrier_ids = Some(carrier_ids.into());
        self
    }

    pub fn with_shortcodes(mut self, shortcodes: impl Into<String>) -> RouteConfig {
        self.shortcodes = Some(shortcodes.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub message_listener: Option<ListenerConfig>,
    pub datagram_listener: Option<ListenerConfig>,

    /// `;` separated IP patterns, `*` matching a single component
    pub allow_ip: String,
    pub deny_ip: String,

    /// the number of messages a peer can have in flight without acknowledging them
    pub max_pending_acks: usize,
    /// ceiling for the global inbound queue and for each connection's outgoing queue,
    ///  `None` for no limit
    pub max_queue_length: Option<usize>,

    pub routes: Vec<RouteConfig>,

    pub dispatcher_idle_backoff: Duration,
    pub listener_poll_interval: Duration,
    /// how long listeners keep accepting connections during shutdown while there is still
    ///  work queued
    pub shutdown_grace_period: Duration,
    pub max_frame_len: usize,

    /// ask peers to restart rather than shut down when the router stops
    pub restart: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterConfig {
    pub fn new() -> RouterConfig {
        RouterConfig {
            message_listener: None,
            datagram_listener: None,
            allow_ip: "".to_string(),
            deny_ip: "".to_string(),
            max_pending_acks: 100,
            max_queue_length: None,
            routes: Vec::new(),
            dispatcher_idle_backoff: Duration::from_secs(1),
            listener_poll_interval: Duration::from_secs(1),
            shutdown_grace_period: Duration::from_secs(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            restart: false,
        }
    }

    pub fn validate(&self, stream_upgrade_available: bool) -> anyhow::Result<()> {
        if self.message_listener.is_none() && self.datagram_listener.is_none() {
            bail!("no listener is configured");
        }
        if self.max_pending_acks == 0 {
            bail!("max_pending_acks must be positive");
        }
        if self.max_frame_len == 0 {
            bail!("max_frame_len must be positive");
        }

        for listener in self.message_listener.iter().chain(self.datagram_listener.iter()) {
            if listener.tls && !stream_upgrade_available {
                bail!("listener on {} requires TLS, but no stream upgrade is available", listener.bind_addr);
            }
        }

        for route in &self.routes {
            if route.peer_name.trim().is_empty() {
                bail!("route without a peer name");
            }
            if route.carrier_ids.is_none() && route.shortcodes.is_none() {
                bail!("route for peer {} has neither carrier ids nor shortcodes", route.peer_name);
            }
        }
        Ok(())
    }
}

/// Splits a `;` separated list, stripping blanks and skipping empty items
pub fn split_list(s: &str) -> Vec<String> {
    s.split(';')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
