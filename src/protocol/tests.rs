//! Wire Protocol Tests
//!
//! Validates codec symmetry, determinism and boundary behavior.
//!
//! ## Test Scopes
//! - **Roundtrips**: every payload shape survives encode/decode intact.
//! - **Determinism**: equal inputs produce byte-identical datagrams, the
//!   property snapshot checksum comparison relies on.
//! - **Boundaries**: malformed input decodes to `None`, oversized payloads
//!   refuse to encode.

#[cfg(test)]
mod tests {
    use crate::protocol::{decode, encode, Envelope, Message, MAX_DATAGRAM_BYTES};
    use crate::state::{StateOp, StateSnapshot, StateUpdate, VersionVector};
    use std::collections::BTreeMap;

    fn envelope(message: Message) -> Envelope {
        Envelope {
            timestamp: 1_700_000_000.25,
            message,
        }
    }

    // ============================================================
    // ROUNDTRIP TESTS
    // ============================================================

    #[test]
    fn test_ping_roundtrip() {
        let original = envelope(Message::Ping {
            sender: "127.0.0.1:7000".to_string(),
            target: "127.0.0.1:7001".to_string(),
        });

        let bytes = encode(&original).expect("Failed to encode ping");
        let decoded = decode(&bytes).expect("Failed to decode ping");

        assert_eq!(decoded, original);
        assert_eq!(decoded.message.kind(), "ping");
        assert_eq!(decoded.message.sender(), "127.0.0.1:7000");
    }

    #[test]
    fn test_ping_req_roundtrip_keeps_helper() {
        let original = envelope(Message::PingReq {
            sender: "127.0.0.1:7000".to_string(),
            target: "127.0.0.1:7002".to_string(),
            helper: "127.0.0.1:7000".to_string(),
        });

        let bytes = encode(&original).expect("Failed to encode ping_req");
        let decoded = decode(&bytes).expect("Failed to decode ping_req");

        match decoded.message {
            Message::PingReq {
                sender,
                target,
                helper,
            } => {
                assert_eq!(sender, "127.0.0.1:7000");
                assert_eq!(target, "127.0.0.1:7002");
                assert_eq!(helper, "127.0.0.1:7000");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_suspect_roundtrip_keeps_incarnation() {
        let original = envelope(Message::Suspect {
            sender: "10.0.0.1:7000".to_string(),
            target: "10.0.0.2:7000".to_string(),
            incarnation: 42,
        });

        let bytes = encode(&original).expect("Failed to encode suspect");
        let decoded = decode(&bytes).expect("Failed to decode suspect");

        match decoded.message {
            Message::Suspect {
                target, incarnation, ..
            } => {
                assert_eq!(target, "10.0.0.2:7000");
                assert_eq!(incarnation, 42);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_members_roundtrip() {
        let original = envelope(Message::Members {
            sender: "127.0.0.1:7000".to_string(),
            members: vec![
                "127.0.0.1:7000".to_string(),
                "127.0.0.1:7001".to_string(),
                "127.0.0.1:7002".to_string(),
            ],
        });

        let bytes = encode(&original).expect("Failed to encode members");
        let decoded = decode(&bytes).expect("Failed to decode members");

        match decoded.message {
            Message::Members { members, .. } => assert_eq!(members.len(), 3),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_state_update_roundtrip() {
        let mut version_vector = VersionVector::new();
        version_vector.increment("node-a");
        version_vector.increment("node-a");
        version_vector.increment("node-b");

        let original = envelope(Message::StateUpdate {
            sender: "127.0.0.1:7000".to_string(),
            updates: vec![StateUpdate {
                namespace: "default".to_string(),
                key: "region".to_string(),
                value_json: Some("\"eu-west\"".to_string()),
                op: StateOp::Set,
                version_vector: version_vector.clone(),
            }],
        });

        let bytes = encode(&original).expect("Failed to encode state_update");
        let decoded = decode(&bytes).expect("Failed to decode state_update");

        match decoded.message {
            Message::StateUpdate { updates, .. } => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].version_vector, version_vector);
                assert_eq!(updates[0].value_json.as_deref(), Some("\"eu-west\""));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_state_sync_roundtrip() {
        let mut state = BTreeMap::new();
        let mut keys = BTreeMap::new();
        keys.insert("k".to_string(), "\"v\"".to_string());
        state.insert("default".to_string(), keys);

        let original = envelope(Message::StateSync {
            sender: "127.0.0.1:7000".to_string(),
            snapshot: StateSnapshot {
                state,
                version_vectors: BTreeMap::new(),
                version: 7,
                checksum: "abc123".to_string(),
            },
        });

        let bytes = encode(&original).expect("Failed to encode state_sync");
        let decoded = decode(&bytes).expect("Failed to decode state_sync");

        assert_eq!(decoded, original);
    }

    // ============================================================
    // DETERMINISM TESTS
    // ============================================================

    #[test]
    fn test_equal_inputs_encode_identically() {
        let make = || {
            envelope(Message::StateSync {
                sender: "127.0.0.1:7000".to_string(),
                snapshot: StateSnapshot {
                    state: BTreeMap::new(),
                    version_vectors: BTreeMap::new(),
                    version: 3,
                    checksum: "deadbeef".to_string(),
                },
            })
        };

        let first = encode(&make()).expect("Failed to encode");
        let second = encode(&make()).expect("Failed to encode");

        assert_eq!(first, second, "Equal inputs must encode byte-identically");
    }

    // ============================================================
    // BOUNDARY TESTS
    // ============================================================

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(&[]).is_none());
        assert!(decode(&[0xff]).is_none());
        assert!(decode(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02]).is_none());
    }

    #[test]
    fn test_decode_rejects_truncated_message() {
        let bytes = encode(&envelope(Message::Join {
            sender: "127.0.0.1:7000".to_string(),
        }))
        .expect("Failed to encode join");

        assert!(decode(&bytes[..bytes.len() / 2]).is_none());
    }

    #[test]
    fn test_encode_rejects_oversized_message() {
        let members: Vec<String> = (0..10_000)
            .map(|i| format!("10.20.30.{}:{}", i % 256, 7000 + (i % 1000)))
            .collect();

        let result = encode(&envelope(Message::Members {
            sender: "127.0.0.1:7000".to_string(),
            members,
        }));

        assert!(result.is_none(), "Oversized payload must refuse to encode");
    }

    #[test]
    fn test_encoded_size_within_datagram_limit() {
        let bytes = encode(&envelope(Message::Join {
            sender: "127.0.0.1:7000".to_string(),
        }))
        .expect("Failed to encode join");

        assert!(bytes.len() <= MAX_DATAGRAM_BYTES);
    }

    // ============================================================
    // KIND NAME TESTS
    // ============================================================

    #[test]
    fn test_kind_names_are_stable() {
        let sender = "127.0.0.1:7000".to_string();
        let target = "127.0.0.1:7001".to_string();

        assert_eq!(Message::Join { sender: sender.clone() }.kind(), "join");
        assert_eq!(
            Message::Ack {
                sender: sender.clone(),
                target: target.clone()
            }
            .kind(),
            "ack"
        );
        assert_eq!(
            Message::Dead {
                sender: sender.clone(),
                target,
                incarnation: 1
            }
            .kind(),
            "dead"
        );
        assert_eq!(
            Message::Members {
                sender,
                members: vec![]
            }
            .kind(),
            "members"
        );
    }
}
