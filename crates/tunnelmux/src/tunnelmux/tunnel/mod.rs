//! Reverse tunnel: clients behind NAT keep a multiplexed control session to
//! the bridge, and the server opens one logical link per public connection.

pub mod bridge;
pub mod client;
pub mod codec;
pub mod datagram;
pub mod frame;
pub mod link;
pub mod local;
pub mod manager;
pub mod mux;
pub mod p2p;
pub mod protocol;
pub mod rendezvous;
pub mod server;
pub mod transport;
