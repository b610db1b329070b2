//! Message router between carrier connections and the application side "box" peers that connect
//!  to it over persistent TCP connections.
//!
//! Carrier traffic enters through the [router::Router]'s carrier callbacks, is dispatched to one
//!  of the connected peers based on static routing rules and the peers' self-announced names,
//!  and acknowledgments flow back from the peers to the carrier layer. Datagram peers get
//!  per-source affinity instead of rule-based routing.

pub mod carrier;
pub mod config;
pub mod framing;
pub mod message;
pub mod peer;
pub mod queue;
pub mod router;
pub mod routing;
pub mod shutdown;
pub mod status;
pub mod test_util;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
