use serde::{Deserialize, Serialize};

use crate::state::{StateSnapshot, StateUpdate};

/// The wire protocol for inter-node communication via UDP.
///
/// Peers are identified by their `"host:port"` address strings; `sender` is
/// always the advertised address of the emitting node, not the socket source
/// address (the two can differ behind address translation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Sent by a new node to each configured seed to enter the cluster.
    Join { sender: String },

    /// Reply to a ping or join, confirming the sender is alive.
    Ack { sender: String, target: String },

    /// Direct health probe.
    Ping { sender: String, target: String },

    /// Request that `helper` probe `target` on the sender's behalf, used to
    /// tell a dead target from a broken sender-to-target path.
    PingReq {
        sender: String,
        target: String,
        helper: String,
    },

    /// Relayed by a helper back to the original prober once the target
    /// answered the helper's ping.
    PingAck {
        sender: String,
        target: String,
        helper: String,
    },

    /// Dissemination: `target` missed a probe window at `incarnation`.
    Suspect {
        sender: String,
        target: String,
        incarnation: u64,
    },

    /// Dissemination and refutation: `target` is alive at `incarnation`.
    Alive {
        sender: String,
        target: String,
        incarnation: u64,
    },

    /// Dissemination: `target` is confirmed failed at `incarnation`.
    Dead {
        sender: String,
        target: String,
        incarnation: u64,
    },

    /// Reply to a join: the full address list of the sender's directory.
    Members {
        sender: String,
        members: Vec<String>,
    },

    /// Anti-entropy: full metadata snapshot.
    StateSync {
        sender: String,
        snapshot: StateSnapshot,
    },

    /// Incremental metadata gossip.
    StateUpdate {
        sender: String,
        updates: Vec<StateUpdate>,
    },
}

impl Message {
    /// Advertised address of the emitting node.
    pub fn sender(&self) -> &str {
        match self {
            Message::Join { sender }
            | Message::Ack { sender, .. }
            | Message::Ping { sender, .. }
            | Message::PingReq { sender, .. }
            | Message::PingAck { sender, .. }
            | Message::Suspect { sender, .. }
            | Message::Alive { sender, .. }
            | Message::Dead { sender, .. }
            | Message::Members { sender, .. }
            | Message::StateSync { sender, .. }
            | Message::StateUpdate { sender, .. } => sender,
        }
    }

    /// Stable wire name of the variant, for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "join",
            Message::Ack { .. } => "ack",
            Message::Ping { .. } => "ping",
            Message::PingReq { .. } => "ping_req",
            Message::PingAck { .. } => "ping_ack",
            Message::Suspect { .. } => "suspect",
            Message::Alive { .. } => "alive",
            Message::Dead { .. } => "dead",
            Message::Members { .. } => "members",
            Message::StateSync { .. } => "state_sync",
            Message::StateUpdate { .. } => "state_update",
        }
    }
}

/// One datagram: a message stamped with the sender's wall clock.
///
/// The timestamp is informational (debugging, skew diagnostics); protocol
/// decisions never depend on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: f64,
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            timestamp: crate::now_secs(),
            message,
        }
    }
}
