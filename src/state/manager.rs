use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::types::{StateOp, StateSnapshot, StateUpdate, VersionVector};

/// Callback invoked after a state mutation: (namespace, key, value, op).
/// The value is `None` for deletions.
pub type StateSubscriber = Arc<dyn Fn(&str, &str, Option<&Value>, StateOp) + Send + Sync>;

/// One stored entry. A `None` value is a tombstone: the key was deleted but
/// its version vector must survive so stale remote writes cannot resurrect
/// it.
#[derive(Debug, Clone)]
struct StateEntry {
    value: Option<Value>,
    version_vector: VersionVector,
}

/// Namespaced key-value store with per-key version vectors.
///
/// Reads go straight to the concurrent map; every mutating operation
/// serializes on a single lock so merge decisions observe a stable entry.
/// Subscribers are notified after the locks are released with a copy of the
/// mutation payload.
pub struct StateManager {
    /// Opaque id owning this process's version-vector component. Random per
    /// start, never equal to a peer address.
    node_id: String,
    data: DashMap<String, DashMap<String, StateEntry>>,
    /// Monotonic local mutation counter, used only as a freshness hint when
    /// comparing snapshots.
    version: AtomicU64,
    write_lock: Mutex<()>,
    subscribers: RwLock<Vec<StateSubscriber>>,
}

/// Notification payload captured under the lock, dispatched after it.
struct Notification {
    namespace: String,
    key: String,
    value: Option<Value>,
    op: StateOp,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            data: DashMap::new(),
            version: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Registers a metadata-change callback. Callbacks run synchronously
    /// after each mutation; a panicking callback is caught and logged and
    /// does not stop the others.
    pub fn subscribe(&self, subscriber: StateSubscriber) {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(subscriber);
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        let ns = self.data.get(namespace)?;
        let entry = ns.get(key)?;
        entry.value.clone()
    }

    /// Writes a value. Returns `false` when the arguments are invalid or the
    /// value deep-equals the current one (no mutation, nothing gossiped).
    pub fn set(&self, namespace: &str, key: &str, value: Value) -> bool {
        if namespace.is_empty() || key.is_empty() {
            return false;
        }

        let notification;
        {
            let _guard = self
                .write_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let ns = self.data.entry(namespace.to_string()).or_default();
            let mut version_vector = match ns.get(key) {
                Some(existing) => {
                    if existing.value.as_ref() == Some(&value) {
                        return false;
                    }
                    existing.version_vector.clone()
                }
                None => VersionVector::new(),
            };
            version_vector.increment(&self.node_id);

            ns.insert(
                key.to_string(),
                StateEntry {
                    value: Some(value.clone()),
                    version_vector,
                },
            );
            self.version.fetch_add(1, Ordering::SeqCst);

            notification = Notification {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: Some(value),
                op: StateOp::Set,
            };
        }

        self.notify(&[notification]);
        true
    }

    /// Deletes a key, leaving a tombstone carrying the bumped version
    /// vector. Returns `false` when the key is absent or already deleted.
    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        if namespace.is_empty() || key.is_empty() {
            return false;
        }

        let notification;
        {
            let _guard = self
                .write_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let Some(ns) = self.data.get(namespace) else {
                return false;
            };
            let mut version_vector = match ns.get(key) {
                Some(existing) if existing.value.is_some() => existing.version_vector.clone(),
                _ => return false,
            };
            version_vector.increment(&self.node_id);

            ns.insert(
                key.to_string(),
                StateEntry {
                    value: None,
                    version_vector,
                },
            );
            self.version.fetch_add(1, Ordering::SeqCst);

            notification = Notification {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: None,
                op: StateOp::Delete,
            };
        }

        self.notify(&[notification]);
        true
    }

    /// Builds the gossip record for a key from its current entry, after a
    /// local `set` or `delete` reported a change.
    pub fn make_update(&self, namespace: &str, key: &str) -> Option<StateUpdate> {
        let ns = self.data.get(namespace)?;
        let entry = ns.get(key)?;
        let (value_json, op) = match &entry.value {
            Some(value) => (Some(serde_json::to_string(value).ok()?), StateOp::Set),
            None => (None, StateOp::Delete),
        };
        Some(StateUpdate {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value_json,
            op,
            version_vector: entry.version_vector.clone(),
        })
    }

    /// Applies incremental updates received from a peer. Returns how many
    /// were actually applied.
    ///
    /// Per update, against the local copy of the same key:
    /// - remote already observed: skip;
    /// - remote strictly dominates: overwrite (or delete);
    /// - concurrent: deterministic tie-break, the lexicographically larger
    ///   serialized value wins and a deletion loses to any present value.
    /// Whatever wins, the stored vector becomes the componentwise max, so
    /// every replica settles on the same entry.
    pub fn merge_update(&self, updates: &[StateUpdate]) -> usize {
        let mut notifications = Vec::new();
        let mut applied = 0;
        {
            let _guard = self
                .write_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            for update in updates {
                if update.namespace.is_empty() || update.key.is_empty() {
                    continue;
                }
                let remote_value = match &update.value_json {
                    Some(json) => match serde_json::from_str::<Value>(json) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            tracing::warn!(
                                "Dropping malformed update for {}/{}: {}",
                                update.namespace,
                                update.key,
                                e
                            );
                            continue;
                        }
                    },
                    None => None,
                };

                let ns = self.data.entry(update.namespace.clone()).or_default();
                let local = ns.get(&update.key).map(|entry| entry.value().clone());

                let (local_value, mut local_vv) = match local {
                    Some(entry) => (entry.value, entry.version_vector),
                    None => (None, VersionVector::new()),
                };

                if local_vv.descends(&update.version_vector) {
                    continue;
                }

                let take_remote = if update.version_vector.descends(&local_vv) {
                    true
                } else {
                    // Concurrent: compare serialized values, tombstone lowest.
                    let local_json = local_value
                        .as_ref()
                        .and_then(|value| serde_json::to_string(value).ok());
                    update.value_json > local_json
                };

                local_vv.merge(&update.version_vector);

                let new_value = if take_remote {
                    remote_value
                } else {
                    local_value.clone()
                };
                let changed = new_value != local_value;

                ns.insert(
                    update.key.clone(),
                    StateEntry {
                        value: new_value.clone(),
                        version_vector: local_vv,
                    },
                );
                self.version.fetch_add(1, Ordering::SeqCst);
                applied += 1;

                if changed {
                    let op = match new_value {
                        Some(_) => StateOp::Set,
                        None => StateOp::Delete,
                    };
                    notifications.push(Notification {
                        namespace: update.namespace.clone(),
                        key: update.key.clone(),
                        value: new_value,
                        op,
                    });
                }
            }
        }

        self.notify(&notifications);
        applied
    }

    /// Full-store view for anti-entropy. Deterministically ordered so two
    /// stores with equal content produce byte-identical encodings.
    pub fn snapshot(&self) -> StateSnapshot {
        let mut state: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut version_vectors: BTreeMap<String, BTreeMap<String, VersionVector>> =
            BTreeMap::new();

        for ns in self.data.iter() {
            for entry in ns.value().iter() {
                version_vectors
                    .entry(ns.key().clone())
                    .or_default()
                    .insert(entry.key().clone(), entry.version_vector.clone());
                if let Some(value) = &entry.value {
                    if let Ok(json) = serde_json::to_string(value) {
                        state
                            .entry(ns.key().clone())
                            .or_default()
                            .insert(entry.key().clone(), json);
                    }
                }
            }
        }

        let checksum = checksum_of(&state);
        StateSnapshot {
            state,
            version_vectors,
            version: self.version.load(Ordering::SeqCst),
            checksum,
        }
    }

    /// Replaces the whole store with a peer's snapshot if its checksum
    /// validates and it is fresher than the local store. Returns whether the
    /// snapshot was applied.
    pub fn apply_snapshot(&self, snapshot: &StateSnapshot) -> bool {
        if checksum_of(&snapshot.state) != snapshot.checksum {
            tracing::warn!("Rejecting snapshot with invalid checksum");
            return false;
        }

        let mut notifications = Vec::new();
        {
            let _guard = self
                .write_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if snapshot.version <= self.version.load(Ordering::SeqCst) {
                return false;
            }

            // Diff before replacing so subscribers hear about exactly the
            // keys that change, including ones the snapshot no longer
            // carries.
            let mut previous: BTreeMap<(String, String), Value> = BTreeMap::new();
            for ns in self.data.iter() {
                for entry in ns.value().iter() {
                    if let Some(value) = &entry.value {
                        previous.insert((ns.key().clone(), entry.key().clone()), value.clone());
                    }
                }
            }

            self.data.clear();
            for (namespace, keys) in &snapshot.version_vectors {
                let ns = self.data.entry(namespace.clone()).or_default();
                for (key, version_vector) in keys {
                    let value = snapshot
                        .state
                        .get(namespace)
                        .and_then(|values| values.get(key))
                        .and_then(|json| serde_json::from_str::<Value>(json).ok());

                    let slot = (namespace.clone(), key.clone());
                    match &value {
                        Some(new_value) if previous.get(&slot) != Some(new_value) => {
                            notifications.push(Notification {
                                namespace: namespace.clone(),
                                key: key.clone(),
                                value: Some(new_value.clone()),
                                op: StateOp::Set,
                            });
                        }
                        _ => {}
                    }
                    previous.remove(&slot);

                    ns.insert(
                        key.clone(),
                        StateEntry {
                            value,
                            version_vector: version_vector.clone(),
                        },
                    );
                }
            }
            self.version.store(snapshot.version, Ordering::SeqCst);

            for ((namespace, key), _) in previous {
                notifications.push(Notification {
                    namespace,
                    key,
                    value: None,
                    op: StateOp::Delete,
                });
            }
        }

        self.notify(&notifications);
        true
    }

    fn notify(&self, notifications: &[Notification]) {
        if notifications.is_empty() {
            return;
        }
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for notification in notifications {
            for subscriber in &subscribers {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    subscriber(
                        &notification.namespace,
                        &notification.key,
                        notification.value.as_ref(),
                        notification.op,
                    )
                }));
                if result.is_err() {
                    tracing::error!(
                        "Metadata subscriber panicked on {}/{}",
                        notification.namespace,
                        notification.key
                    );
                }
            }
        }
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 hex digest over the sorted serialization of the live state map.
fn checksum_of(state: &BTreeMap<String, BTreeMap<String, String>>) -> String {
    let serialized = serde_json::to_string(state).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
