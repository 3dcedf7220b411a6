use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-key version vector: owning node id -> write counter.
///
/// Lets the merge logic distinguish three cases between a local and a remote
/// copy of the same entry: the remote is older (skip), the remote strictly
/// dominates (overwrite), or the two are concurrent (deterministic
/// tie-break). Keys are opaque node ids, never peer addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(pub BTreeMap<String, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter recorded for `node_id`, zero if absent.
    pub fn get(&self, node_id: &str) -> u64 {
        self.0.get(node_id).copied().unwrap_or(0)
    }

    /// Bumps the counter owned by `node_id`. Called on every local mutation.
    pub fn increment(&mut self, node_id: &str) {
        *self.0.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// True if `self` has observed everything `other` has (componentwise
    /// `self >= other`). Equal vectors descend each other.
    pub fn descends(&self, other: &VersionVector) -> bool {
        other
            .0
            .iter()
            .all(|(node_id, counter)| self.get(node_id) >= *counter)
    }

    /// True if neither vector descends the other: the two writes happened
    /// without having seen each other.
    pub fn concurrent_with(&self, other: &VersionVector) -> bool {
        !self.descends(other) && !other.descends(self)
    }

    /// Componentwise maximum. The merged vector descends both inputs.
    pub fn merge(&mut self, other: &VersionVector) {
        for (node_id, counter) in &other.0 {
            let entry = self.0.entry(node_id.clone()).or_insert(0);
            if *counter > *entry {
                *entry = *counter;
            }
        }
    }
}

/// Kind of mutation carried by a [`StateUpdate`] and reported to
/// metadata-change subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateOp {
    Set,
    Delete,
}

/// One incremental mutation, gossiped to peers after a local write.
///
/// The value travels as a JSON string so the binary envelope stays
/// self-contained; `None` marks a deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub namespace: String,
    pub key: String,
    pub value_json: Option<String>,
    pub op: StateOp,
    pub version_vector: VersionVector,
}

/// Full-store snapshot exchanged during anti-entropy.
///
/// `state` holds only live entries; `version_vectors` additionally holds the
/// vectors of deleted entries so tombstones survive a snapshot transfer.
/// Both maps are ordered so equal stores encode byte-identically, which is
/// what makes the checksum comparable across nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// namespace -> key -> JSON-serialized value.
    pub state: BTreeMap<String, BTreeMap<String, String>>,
    /// namespace -> key -> version vector, covering live and deleted keys.
    pub version_vectors: BTreeMap<String, BTreeMap<String, VersionVector>>,
    /// Freshness hint: the sender's local mutation counter.
    pub version: u64,
    /// SHA-256 hex digest over the serialized `state` map.
    pub checksum: String,
}
