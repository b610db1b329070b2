pub mod datagram_router;
pub mod dispatcher;
pub mod routing_table;
