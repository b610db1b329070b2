pub mod connection;
pub mod ip_filter;
pub mod listener;
pub mod receiver;
pub mod sender;
