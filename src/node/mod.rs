//! Node API Module
//!
//! The public face of the crate: constructs and wires the transport, the
//! directory, the state store and the SWIM engine, and exposes the member
//! views, metadata accessors and change subscriptions that launchers and
//! introspection layers consume.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

use crate::config::NodeConfig;
use crate::membership::{Directory, Member, MemberEvent, MemberStatus, SwimService};
use crate::state::{StateManager, StateOp};
use crate::transport::{Transport, TransportStats};


/// Namespace used by the single-argument metadata accessors.
pub const DEFAULT_NAMESPACE: &str = "default";

/// One cluster node: a bound UDP socket, a membership directory with this
/// node as a member, a metadata store and the protocol engine.
///
/// Construction binds the socket (the only fatal error); `start` and `stop`
/// are idempotent and a stopped node can be started again on the same
/// address. Dropping the node without `stop` leaves no threads behind once
/// the runtime shuts down, but `stop` is the polite path.
pub struct ClusterNode {
    service: Arc<SwimService>,
}

impl ClusterNode {
    /// Binds the socket and assembles the node. With a port-0 bind address
    /// the node identity becomes the actually bound address.
    pub async fn new(config: NodeConfig) -> Result<Arc<Self>> {
        let transport = Arc::new(Transport::bind(&config.bind_addr).await?);
        let directory = Arc::new(Directory::new(transport.address()));
        let state = Arc::new(StateManager::new());

        for (namespace, keys) in &config.initial_metadata {
            for (key, value) in keys {
                state.set(namespace, key, value.clone());
            }
        }

        let service = SwimService::new(config, directory, state, transport);
        Ok(Arc::new(Self { service }))
    }

    /// Starts the engine and contacts the configured seeds. No-op if
    /// already running.
    pub async fn start(&self) {
        self.service.clone().start().await;
    }

    /// Stops the engine and the transport. No-op if not running.
    pub async fn stop(&self) {
        self.service.stop().await;
    }

    /// This node's `"host:port"` identity.
    pub fn address(&self) -> String {
        self.service.directory().self_address().to_string()
    }

    /// Opaque id owning this node's version-vector component.
    pub fn node_id(&self) -> String {
        self.service.state().node_id().to_string()
    }

    /// Addresses of peers currently alive (self excluded).
    pub fn alive_members(&self) -> Vec<String> {
        self.service
            .directory()
            .alive_peers()
            .into_iter()
            .map(|member| member.address)
            .collect()
    }

    /// Addresses of peers currently suspected (self excluded).
    pub fn suspect_members(&self) -> Vec<String> {
        self.service
            .directory()
            .suspect_peers()
            .into_iter()
            .map(|member| member.address)
            .collect()
    }

    /// Addresses of peers currently considered dead (self excluded).
    /// Usually empty, since dead members are announced and removed.
    pub fn dead_members(&self) -> Vec<String> {
        self.service
            .directory()
            .dead_peers()
            .into_iter()
            .map(|member| member.address)
            .collect()
    }

    /// Snapshot of every directory entry, self included.
    pub fn members(&self) -> Vec<Member> {
        self.service.directory().members_snapshot()
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.get_metadata_in(DEFAULT_NAMESPACE, key)
    }

    pub fn get_metadata_in(&self, namespace: &str, key: &str) -> Option<Value> {
        self.service.state().get(namespace, key)
    }

    /// Writes a metadata value and gossips the change. Returns `false` for
    /// invalid arguments or when the value already matches.
    pub async fn set_metadata(&self, key: &str, value: Value) -> bool {
        self.set_metadata_in(DEFAULT_NAMESPACE, key, value).await
    }

    pub async fn set_metadata_in(&self, namespace: &str, key: &str, value: Value) -> bool {
        if !self.service.state().set(namespace, key, value) {
            return false;
        }
        self.service
            .broadcast_metadata_update(namespace, key)
            .await;
        true
    }

    /// Deletes a metadata key and gossips the deletion. Returns `false`
    /// when the key is absent.
    pub async fn delete_metadata(&self, key: &str) -> bool {
        self.delete_metadata_in(DEFAULT_NAMESPACE, key).await
    }

    pub async fn delete_metadata_in(&self, namespace: &str, key: &str) -> bool {
        if !self.service.state().delete(namespace, key) {
            return false;
        }
        self.service
            .broadcast_metadata_update(namespace, key)
            .await;
        true
    }

    /// Registers a membership-change callback:
    /// `(address, old_status, new_status)`, with `None` standing for
    /// "not in the directory" on either side.
    pub fn on_member_change<F>(&self, callback: F)
    where
        F: Fn(&str, Option<MemberStatus>, Option<MemberStatus>) + Send + Sync + 'static,
    {
        self.service.directory().subscribe(Arc::new(move |event| {
            let (old_status, new_status) = match event {
                MemberEvent::Joined { .. } => (None, Some(MemberStatus::Alive)),
                MemberEvent::Left { last_status, .. } => (Some(*last_status), None),
                MemberEvent::Suspected { .. } => {
                    (Some(MemberStatus::Alive), Some(MemberStatus::Suspect))
                }
                MemberEvent::Failed { .. } => {
                    (Some(MemberStatus::Suspect), Some(MemberStatus::Dead))
                }
                MemberEvent::Recovered { .. } => {
                    (Some(MemberStatus::Suspect), Some(MemberStatus::Alive))
                }
            };
            callback(event.address(), old_status, new_status);
        }));
    }

    /// Registers a metadata-change callback: `(namespace, key, value, op)`,
    /// invoked for local writes and remote merges alike.
    pub fn on_metadata_change<F>(&self, callback: F)
    where
        F: Fn(&str, &str, Option<&Value>, StateOp) + Send + Sync + 'static,
    {
        self.service.state().subscribe(Arc::new(callback));
    }

    /// Datagram counters for introspection.
    pub fn transport_stats(&self) -> TransportStats {
        self.service.transport().stats()
    }
}
