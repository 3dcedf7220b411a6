//! Node Configuration
//!
//! Bind address, seed list, initial metadata and protocol timings.
//! Defaults follow the usual SWIM parameters; tests shrink the intervals to
//! keep convergence under a second.

use std::collections::HashMap;
use std::time::Duration;

/// Configuration for a cluster node.
///
/// Timings drive the three periodic engine tasks (probe tick, timeout sweep,
/// anti-entropy) and the failure-detection ladder.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the UDP socket binds to. Port 0 picks a free port; the node
    /// then advertises the actual bound address as its identity.
    pub bind_addr: String,
    /// Seed addresses ("host:port") contacted on startup to join an
    /// existing cluster. Empty means this node founds a new cluster.
    pub seeds: Vec<String>,
    /// Metadata written into the local store before the node starts,
    /// keyed namespace -> key -> value.
    pub initial_metadata: HashMap<String, HashMap<String, serde_json::Value>>,
    /// Interval between probe ticks and timeout sweeps.
    pub probe_interval: Duration,
    /// How long a direct probe may go unanswered before the target turns
    /// suspect.
    pub ping_timeout: Duration,
    /// How long a member may stay suspect before it is declared dead.
    pub suspect_timeout: Duration,
    /// Grace period after which a lingering dead entry is swept out.
    pub dead_timeout: Duration,
    /// Interval between anti-entropy snapshot exchanges.
    pub sync_interval: Duration,
    /// Number of helper peers used for an indirect probe.
    pub indirect_probes: usize,
    /// How long to wait for a seed reply before logging that the node
    /// continues as a single-node cluster. Seeds are still retried on every
    /// anti-entropy tick while the directory holds only this node.
    pub bootstrap_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let probe_interval = Duration::from_secs(1);
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            seeds: Vec::new(),
            initial_metadata: HashMap::new(),
            probe_interval,
            ping_timeout: Duration::from_millis(500),
            suspect_timeout: Duration::from_secs(5),
            dead_timeout: Duration::from_secs(30),
            sync_interval: Duration::from_secs(10),
            indirect_probes: 3,
            bootstrap_timeout: probe_interval * 10,
        }
    }
}

impl NodeConfig {
    /// Convenience constructor matching the common launcher shape.
    pub fn new(bind_addr: impl Into<String>, seeds: Vec<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            seeds,
            ..Self::default()
        }
    }
}
