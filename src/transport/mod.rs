//! Datagram Transport Module
//!
//! Owns the UDP socket and nothing else touches it. Outbound messages are
//! encoded and sent best-effort; inbound datagrams are decoded by a single
//! receive loop and published to the protocol engine through a channel.
//!
//! Delivery is unordered, unreliable and possibly duplicated. Every network
//! error is non-fatal: sends report failure to the caller and the receive
//! loop drops what it cannot decode, counting as it goes.

pub mod service;

pub use service::{Transport, TransportStats};
