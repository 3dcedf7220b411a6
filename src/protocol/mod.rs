//! Wire Protocol Module
//!
//! Defines the tagged message variants exchanged between peers over UDP and
//! the binary codec that turns them into datagrams.
//!
//! Every datagram is one [`Envelope`]: a wall-clock timestamp plus a
//! [`Message`]. Encoding is deterministic for equal inputs, which lets the
//! anti-entropy path compare snapshot checksums across nodes. Anything that
//! fails to encode or decode is treated as a protocol-level drop, never an
//! error that reaches the engine.

pub mod codec;
pub mod types;

pub use codec::{decode, encode, MAX_DATAGRAM_BYTES};
pub use types::{Envelope, Message};

#[cfg(test)]
mod tests;
