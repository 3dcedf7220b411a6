//! Metadata State Tests
//!
//! Validates the version-vector algebra, the merge rules and the
//! anti-entropy snapshot path.
//!
//! ## Test Scopes
//! - **Version vectors**: increment, descent and concurrency detection.
//! - **Local operations**: set/delete semantics, no-op detection, tombstones.
//! - **Merge**: dominance, staleness, concurrent tie-break convergence.
//! - **Snapshots**: checksum validation, freshness gating, diff notification.

#[cfg(test)]
mod tests {
    use crate::state::{StateManager, StateOp, StateUpdate, VersionVector};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    // ============================================================
    // VERSION VECTOR TESTS
    // ============================================================

    #[test]
    fn test_version_vector_increment() {
        let mut vv = VersionVector::new();
        assert_eq!(vv.get("a"), 0);

        vv.increment("a");
        vv.increment("a");
        vv.increment("b");

        assert_eq!(vv.get("a"), 2);
        assert_eq!(vv.get("b"), 1);
    }

    #[test]
    fn test_version_vector_descends() {
        let mut older = VersionVector::new();
        older.increment("a");

        let mut newer = older.clone();
        newer.increment("a");
        newer.increment("b");

        assert!(newer.descends(&older));
        assert!(!older.descends(&newer));
        // Every vector descends the empty vector and itself.
        assert!(older.descends(&VersionVector::new()));
        assert!(older.descends(&older.clone()));
    }

    #[test]
    fn test_version_vector_concurrency() {
        let mut left = VersionVector::new();
        left.increment("a");

        let mut right = VersionVector::new();
        right.increment("b");

        assert!(left.concurrent_with(&right));
        assert!(right.concurrent_with(&left));

        let mut merged = left.clone();
        merged.merge(&right);
        assert!(merged.descends(&left));
        assert!(merged.descends(&right));
        assert!(!merged.concurrent_with(&left));
    }

    // ============================================================
    // LOCAL OPERATION TESTS
    // ============================================================

    #[test]
    fn test_set_and_get() {
        let state = StateManager::new();

        assert!(state.set("default", "k", json!("v1")));
        assert_eq!(state.get("default", "k"), Some(json!("v1")));
        assert_eq!(state.get("default", "missing"), None);
        assert_eq!(state.get("other", "k"), None);
    }

    #[test]
    fn test_set_equal_value_is_noop() {
        let state = StateManager::new();

        assert!(state.set("default", "k", json!({"a": 1})));
        let version = state.version();

        assert!(!state.set("default", "k", json!({"a": 1})));
        assert_eq!(state.version(), version, "No-op set must not bump version");
    }

    #[test]
    fn test_set_rejects_empty_names() {
        let state = StateManager::new();

        assert!(!state.set("", "k", json!(1)));
        assert!(!state.set("ns", "", json!(1)));
        assert!(!state.delete("", "k"));
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let state = StateManager::new();

        assert!(!state.delete("default", "k"), "Deleting absent key is a no-op");
        assert!(state.set("default", "k", json!("v")));
        assert!(state.delete("default", "k"));
        assert_eq!(state.get("default", "k"), None);
        assert!(!state.delete("default", "k"), "Second delete is a no-op");

        // The tombstone still gossips with a bumped vector.
        let update = state.make_update("default", "k").expect("Missing tombstone record");
        assert_eq!(update.op, StateOp::Delete);
        assert!(update.value_json.is_none());
        assert_eq!(update.version_vector.get(state.node_id()), 2);
    }

    #[test]
    fn test_version_advances_on_mutation() {
        let state = StateManager::new();
        assert_eq!(state.version(), 0);

        state.set("default", "a", json!(1));
        state.set("default", "b", json!(2));
        state.delete("default", "a");

        assert_eq!(state.version(), 3);
    }

    // ============================================================
    // MERGE TESTS
    // ============================================================

    #[test]
    fn test_merge_applies_dominating_update() {
        let writer = StateManager::new();
        let reader = StateManager::new();

        writer.set("default", "k", json!("v1"));
        let update = writer.make_update("default", "k").unwrap();

        assert_eq!(reader.merge_update(&[update]), 1);
        assert_eq!(reader.get("default", "k"), Some(json!("v1")));
    }

    #[test]
    fn test_merge_skips_already_observed_update() {
        let writer = StateManager::new();
        let reader = StateManager::new();

        writer.set("default", "k", json!("v1"));
        let update = writer.make_update("default", "k").unwrap();

        assert_eq!(reader.merge_update(&[update.clone()]), 1);
        assert_eq!(
            reader.merge_update(&[update]),
            0,
            "Replayed update must be skipped"
        );
    }

    #[test]
    fn test_merge_skips_stale_update() {
        let writer = StateManager::new();
        let reader = StateManager::new();

        writer.set("default", "k", json!("v1"));
        let stale = writer.make_update("default", "k").unwrap();

        writer.set("default", "k", json!("v2"));
        let fresh = writer.make_update("default", "k").unwrap();

        reader.merge_update(&[fresh]);
        assert_eq!(reader.merge_update(&[stale]), 0);
        assert_eq!(reader.get("default", "k"), Some(json!("v2")));
    }

    #[test]
    fn test_concurrent_writes_converge_both_directions() {
        let left = StateManager::new();
        let right = StateManager::new();

        left.set("default", "k", json!("A"));
        right.set("default", "k", json!("C"));

        let from_left = left.make_update("default", "k").unwrap();
        let from_right = right.make_update("default", "k").unwrap();

        left.merge_update(&[from_right]);
        right.merge_update(&[from_left]);

        // Deterministic tie-break: lexicographic max of the serialized value.
        assert_eq!(left.get("default", "k"), Some(json!("C")));
        assert_eq!(right.get("default", "k"), Some(json!("C")));
    }

    #[test]
    fn test_concurrent_delete_loses_to_write() {
        let writer = StateManager::new();
        let deleter = StateManager::new();

        // Both start from the same observed entry.
        writer.set("default", "k", json!("base"));
        let base = writer.make_update("default", "k").unwrap();
        deleter.merge_update(&[base]);

        writer.set("default", "k", json!("kept"));
        deleter.delete("default", "k");

        let write = writer.make_update("default", "k").unwrap();
        let tombstone = deleter.make_update("default", "k").unwrap();

        writer.merge_update(&[tombstone]);
        deleter.merge_update(&[write]);

        assert_eq!(writer.get("default", "k"), Some(json!("kept")));
        assert_eq!(deleter.get("default", "k"), Some(json!("kept")));
    }

    #[test]
    fn test_merged_vector_descends_remote() {
        let writer = StateManager::new();
        let reader = StateManager::new();

        writer.set("default", "k", json!("v"));
        let update = writer.make_update("default", "k").unwrap();
        reader.merge_update(&[update.clone()]);

        let local = reader.make_update("default", "k").unwrap();
        assert!(local.version_vector.descends(&update.version_vector));
    }

    #[test]
    fn test_merge_drops_malformed_update() {
        let reader = StateManager::new();
        let mut vv = VersionVector::new();
        vv.increment("someone");

        let applied = reader.merge_update(&[StateUpdate {
            namespace: "default".to_string(),
            key: "k".to_string(),
            value_json: Some("{not json".to_string()),
            op: StateOp::Set,
            version_vector: vv,
        }]);

        assert_eq!(applied, 0);
        assert_eq!(reader.get("default", "k"), None);
    }

    // ============================================================
    // SNAPSHOT TESTS
    // ============================================================

    #[test]
    fn test_snapshot_checksum_is_stable() {
        let state = StateManager::new();
        state.set("default", "k", json!("v"));
        state.set("other", "x", json!([1, 2, 3]));

        let first = state.snapshot();
        let second = state.snapshot();

        assert_eq!(first.checksum, second.checksum);
        assert_eq!(first.state, second.state);
    }

    #[test]
    fn test_apply_snapshot_replaces_store() {
        let source = StateManager::new();
        let target = StateManager::new();

        source.set("default", "k", json!("v"));
        source.set("jobs", "pending", json!(4));
        // Target holds a key the snapshot does not carry.
        target.set("default", "stale", json!(true));

        // Push source version past target's so the snapshot wins.
        source.set("default", "k2", json!("v2"));
        assert!(target.apply_snapshot(&source.snapshot()));

        assert_eq!(target.get("default", "k"), Some(json!("v")));
        assert_eq!(target.get("jobs", "pending"), Some(json!(4)));
        assert_eq!(target.get("default", "stale"), None);
    }

    #[test]
    fn test_apply_snapshot_rejects_stale_version() {
        let source = StateManager::new();
        let target = StateManager::new();

        source.set("default", "k", json!("v"));
        target.set("default", "a", json!(1));
        target.set("default", "b", json!(2));

        assert!(
            !target.apply_snapshot(&source.snapshot()),
            "Snapshot with lower version must be rejected"
        );
        assert_eq!(target.get("default", "a"), Some(json!(1)));
    }

    #[test]
    fn test_apply_snapshot_rejects_bad_checksum() {
        let source = StateManager::new();
        let target = StateManager::new();

        source.set("default", "k", json!("v"));
        let mut snapshot = source.snapshot();
        snapshot.checksum = "0000".to_string();

        assert!(!target.apply_snapshot(&snapshot));
        assert_eq!(target.get("default", "k"), None);
    }

    #[test]
    fn test_apply_snapshot_preserves_tombstones() {
        let source = StateManager::new();
        let target = StateManager::new();

        source.set("default", "k", json!("v"));
        source.delete("default", "k");
        assert!(target.apply_snapshot(&source.snapshot()));

        // The transferred tombstone must keep beating the stale write.
        let mut stale_vv = VersionVector::new();
        stale_vv.increment(source.node_id());
        let applied = target.merge_update(&[StateUpdate {
            namespace: "default".to_string(),
            key: "k".to_string(),
            value_json: Some("\"zombie\"".to_string()),
            op: StateOp::Set,
            version_vector: stale_vv,
        }]);

        assert_eq!(applied, 0);
        assert_eq!(target.get("default", "k"), None);
    }

    // ============================================================
    // SUBSCRIBER TESTS
    // ============================================================

    #[test]
    fn test_subscribers_hear_local_mutations() {
        let state = StateManager::new();
        let seen: Arc<Mutex<Vec<(String, String, StateOp)>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        state.subscribe(Arc::new(move |ns, key, _value, op| {
            sink.lock().unwrap().push((ns.to_string(), key.to_string(), op));
        }));

        state.set("default", "k", json!("v"));
        state.set("default", "k", json!("v")); // no-op, no event
        state.delete("default", "k");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("default".to_string(), "k".to_string(), StateOp::Set));
        assert_eq!(seen[1], ("default".to_string(), "k".to_string(), StateOp::Delete));
    }

    #[test]
    fn test_snapshot_notifies_only_differing_keys() {
        let source = StateManager::new();
        let target = StateManager::new();

        source.set("default", "same", json!("same"));
        let seed = source.make_update("default", "same").unwrap();
        target.merge_update(&[seed]);

        source.set("default", "fresh", json!("new"));
        target.set("default", "gone", json!("old"));
        source.set("default", "bump", json!(1));

        let events = Arc::new(AtomicUsize::new(0));
        let sink = events.clone();
        target.subscribe(Arc::new(move |_ns, key, _value, _op| {
            assert_ne!(key, "same", "Unchanged key must not notify");
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(target.apply_snapshot(&source.snapshot()));
        // fresh + bump arrived, gone disappeared.
        assert_eq!(events.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_others() {
        let state = StateManager::new();
        let reached = Arc::new(AtomicUsize::new(0));

        state.subscribe(Arc::new(|_ns, _key, _value, _op| {
            panic!("subscriber bug");
        }));
        let sink = reached.clone();
        state.subscribe(Arc::new(move |_ns, _key, _value, _op| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(state.set("default", "k", json!("v")));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }
}
