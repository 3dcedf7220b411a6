use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::directory::Directory;
use super::types::{Member, MemberStatus, TimeoutTransition};
use crate::config::NodeConfig;
use crate::protocol::{Envelope, Message};
use crate::state::StateManager;
use crate::transport::Transport;

/// How long `stop` waits for each worker task before aborting it.
const STOP_DEADLINE: Duration = Duration::from_secs(2);

/// The SWIM protocol engine.
///
/// Three periodic tasks (probe tick, timeout sweep, anti-entropy tick) and a
/// dispatch loop over inbound messages drive all mutations of the directory
/// and the state store. No error escapes a task: handlers log and move on.
pub struct SwimService {
    config: NodeConfig,
    directory: Arc<Directory>,
    state: Arc<StateManager>,
    transport: Arc<Transport>,
    running: AtomicBool,
    /// Wall-clock start time, for the one-shot bootstrap-timeout log line.
    started_at: std::sync::Mutex<f64>,
    bootstrap_logged: AtomicBool,
    /// Indirect-probe bookkeeping: target address -> origin that asked us
    /// to probe it. An ack from the target triggers the relayed ping-ack.
    relay_origins: DashMap<String, String>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SwimService {
    pub fn new(
        config: NodeConfig,
        directory: Arc<Directory>,
        state: Arc<StateManager>,
        transport: Arc<Transport>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            directory,
            state,
            transport,
            running: AtomicBool::new(false),
            started_at: std::sync::Mutex::new(0.0),
            bootstrap_logged: AtomicBool::new(false),
            relay_origins: DashMap::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    fn self_address(&self) -> String {
        self.directory.self_address().to_string()
    }

    /// Starts the transport and all engine loops, then contacts the seeds.
    /// Idempotent: a second start is a no-op.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Engine already started");
            return;
        }
        self.shutdown_tx.send_replace(false);
        *self
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = crate::now_secs();
        self.bootstrap_logged.store(false, Ordering::SeqCst);

        let Some(inbound) = self.transport.start().await else {
            tracing::warn!("Transport was already running; reusing its receive loop");
            return;
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.clone().spawn_dispatch_loop(inbound));
        tasks.push(
            self.clone()
                .spawn_periodic(self.config.probe_interval, TickKind::Probe),
        );
        tasks.push(
            self.clone()
                .spawn_periodic(self.config.probe_interval, TickKind::Sweep),
        );
        tasks.push(
            self.clone()
                .spawn_periodic(self.config.sync_interval, TickKind::Sync),
        );
        drop(tasks);

        self.join_seeds().await;
        tracing::info!(
            "Cluster engine started on {} ({} seed(s))",
            self.self_address(),
            self.config.seeds.len()
        );
    }

    /// Stops the loops and the transport. Tasks that miss the deadline are
    /// aborted and the abort is logged. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        self.transport.stop().await;

        let mut tasks = self.tasks.lock().await;
        for mut handle in tasks.drain(..) {
            if tokio::time::timeout(STOP_DEADLINE, &mut handle).await.is_err() {
                tracing::warn!("Engine task missed the stop deadline, aborting it");
                handle.abort();
            }
        }
        tracing::info!("Cluster engine stopped on {}", self.self_address());
    }

    fn spawn_dispatch_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<(Envelope, SocketAddr)>,
    ) -> JoinHandle<()> {
        let service = self;
        let mut shutdown_rx = service.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    received = inbound.recv() => match received {
                        Some((envelope, remote_addr)) => {
                            service.handle_message(envelope.message, remote_addr).await;
                        }
                        None => break,
                    }
                }
            }
        })
    }

    fn spawn_periodic(self: Arc<Self>, period: Duration, kind: TickKind) -> JoinHandle<()> {
        let service = self;
        let mut shutdown_rx = service.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // Coalesce missed ticks instead of queueing a burst.
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => match kind {
                        TickKind::Probe => service.probe_tick().await,
                        TickKind::Sweep => service.sweep_tick().await,
                        TickKind::Sync => service.sync_tick().await,
                    }
                }
            }
        })
    }

    // --- Periodic tasks ---

    /// Pings one random alive peer that has no probe outstanding. The reply
    /// is matched asynchronously by the ack handler; a missing reply is the
    /// sweep's business.
    async fn probe_tick(&self) {
        let candidates: Vec<Member> = self
            .directory
            .alive_peers()
            .into_iter()
            .filter(|member| member.pending_ping_at.is_none())
            .collect();
        if candidates.is_empty() {
            return;
        }
        let target = {
            let idx = rand::thread_rng().gen_range(0..candidates.len());
            candidates[idx].address.clone()
        };

        // Stamp before sending: a failed send must still time out.
        self.directory.set_pending_ping(&target, crate::now_secs());
        self.transport
            .send_message(
                Message::Ping {
                    sender: self.self_address(),
                    target: target.clone(),
                },
                &target,
            )
            .await;
    }

    /// Walks every peer down the timeout ladder and disseminates verdicts.
    async fn sweep_tick(&self) {
        let transitions = self
            .directory
            .check_timeouts(crate::now_secs(), &self.config);

        for (member, transition) in transitions {
            match transition {
                TimeoutTransition::Suspected => {
                    self.broadcast(Message::Suspect {
                        sender: self.self_address(),
                        target: member.address.clone(),
                        incarnation: member.incarnation,
                    })
                    .await;
                    self.indirect_ping(&member.address).await;
                }
                TimeoutTransition::Failed => {
                    self.broadcast(Message::Dead {
                        sender: self.self_address(),
                        target: member.address.clone(),
                        incarnation: member.incarnation,
                    })
                    .await;
                    self.relay_origins.remove(&member.address);
                    self.directory.remove(&member.address);
                }
                TimeoutTransition::Expired => {
                    self.relay_origins.remove(&member.address);
                    self.directory.remove(&member.address);
                }
            }
        }
    }

    /// Anti-entropy: push a full snapshot to one random alive peer. While
    /// the node is still alone, retry the seeds instead.
    async fn sync_tick(&self) {
        if self.directory.len() <= 1 && !self.config.seeds.is_empty() {
            self.join_seeds().await;
            self.maybe_log_bootstrap_timeout();
            return;
        }

        let peers = self.directory.alive_peers();
        if peers.is_empty() {
            return;
        }
        let target = {
            let idx = rand::thread_rng().gen_range(0..peers.len());
            peers[idx].address.clone()
        };
        self.transport
            .send_message(
                Message::StateSync {
                    sender: self.self_address(),
                    snapshot: self.state.snapshot(),
                },
                &target,
            )
            .await;
    }

    fn maybe_log_bootstrap_timeout(&self) {
        let started_at = *self
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let waited = crate::now_secs() - started_at;
        if waited > self.config.bootstrap_timeout.as_secs_f64()
            && !self.bootstrap_logged.swap(true, Ordering::SeqCst)
        {
            tracing::warn!(
                "No seed answered within {:.1}s; continuing as a single-node cluster \
                 (seeds will still be retried)",
                waited
            );
        }
    }

    /// Sends a join to every configured seed. Seed nodes themselves skip
    /// this entirely.
    async fn join_seeds(&self) {
        let self_address = self.self_address();
        if self.config.seeds.iter().any(|seed| *seed == self_address) {
            return;
        }
        for seed in &self.config.seeds {
            tracing::info!("Sending join request to seed {}", seed);
            self.transport
                .send_message(
                    Message::Join {
                        sender: self_address.clone(),
                    },
                    seed,
                )
                .await;
        }
    }

    /// Asks up to k random alive helpers to probe `target` on our behalf,
    /// to tell a dead target from a broken path.
    async fn indirect_ping(&self, target: &str) {
        let helpers = {
            let mut helpers: Vec<String> = self
                .directory
                .alive_peers()
                .into_iter()
                .map(|member| member.address)
                .filter(|address| address != target)
                .collect();
            helpers.shuffle(&mut rand::thread_rng());
            helpers.truncate(self.config.indirect_probes);
            helpers
        };

        let self_address = self.self_address();
        for helper in helpers {
            self.transport
                .send_message(
                    Message::PingReq {
                        sender: self_address.clone(),
                        target: target.to_string(),
                        helper: self_address.clone(),
                    },
                    &helper,
                )
                .await;
        }
    }

    /// Dissemination fan-out to every peer not known dead.
    async fn broadcast(&self, message: Message) -> usize {
        let targets = self.directory.broadcast_targets();
        self.transport.broadcast_message(message, &targets).await
    }

    /// Gossips the current record of one metadata key after a local
    /// mutation reported a change.
    pub async fn broadcast_metadata_update(&self, namespace: &str, key: &str) {
        if let Some(update) = self.state.make_update(namespace, key) {
            self.broadcast(Message::StateUpdate {
                sender: self.self_address(),
                updates: vec![update],
            })
            .await;
        }
    }

    // --- Message handlers ---

    /// Single entry point for inbound messages. `remote_addr` is the socket
    /// source, used only for logging; protocol identity is the in-message
    /// sender address.
    pub async fn handle_message(&self, message: Message, remote_addr: SocketAddr) {
        tracing::trace!("Received {} from {}", message.kind(), remote_addr);
        match message {
            Message::Join { sender } => self.handle_join(sender).await,
            Message::Ack { sender, .. } => self.handle_ack(sender).await,
            Message::Ping { sender, .. } => self.handle_ping(sender).await,
            Message::PingReq { sender, target, .. } => self.handle_ping_req(sender, target).await,
            Message::PingAck { target, .. } => self.handle_ping_ack(target).await,
            Message::Suspect {
                target,
                incarnation,
                ..
            } => self.handle_suspect(target, incarnation).await,
            Message::Alive {
                target,
                incarnation,
                ..
            } => self.handle_alive(target, incarnation).await,
            Message::Dead {
                target,
                incarnation,
                ..
            } => self.handle_dead(target, incarnation).await,
            Message::Members { members, .. } => self.handle_members(members),
            Message::StateSync { sender, snapshot } => {
                if self.state.apply_snapshot(&snapshot) {
                    tracing::debug!("Applied state snapshot from {}", sender);
                }
            }
            Message::StateUpdate { sender, updates } => {
                let applied = self.state.merge_update(&updates);
                if applied > 0 {
                    tracing::debug!("Merged {} state update(s) from {}", applied, sender);
                }
            }
        }
    }

    /// Makes sure `address` exists in the directory, alive. Known members
    /// are refreshed through the refutation path at their own incarnation.
    fn ensure_alive(&self, address: &str, incarnation: u64) {
        if !self.directory.contains(address) {
            self.directory.add(Member::new(address, incarnation));
        } else {
            let current = self
                .directory
                .get(address)
                .map(|member| member.incarnation)
                .unwrap_or(incarnation);
            self.directory.mark_alive(address, current.max(incarnation));
        }
    }

    async fn handle_join(&self, sender: String) {
        if sender == self.self_address() {
            return;
        }
        self.ensure_alive(&sender, 0);
        let incarnation = self
            .directory
            .get(&sender)
            .map(|member| member.incarnation)
            .unwrap_or(0);

        let self_address = self.self_address();
        self.transport
            .send_message(
                Message::Ack {
                    sender: self_address.clone(),
                    target: sender.clone(),
                },
                &sender,
            )
            .await;
        self.transport
            .send_message(
                Message::Members {
                    sender: self_address.clone(),
                    members: self.directory.addresses(),
                },
                &sender,
            )
            .await;

        // Let the rest of the cluster hear about the joiner right away.
        let mut targets = self.directory.broadcast_targets();
        targets.retain(|address| address != &sender);
        self.transport
            .broadcast_message(
                Message::Alive {
                    sender: self_address,
                    target: sender,
                    incarnation,
                },
                &targets,
            )
            .await;
    }

    async fn handle_ack(&self, sender: String) {
        if sender == self.self_address() {
            return;
        }
        self.ensure_alive(&sender, 0);
        self.directory.record_response(&sender, crate::now_secs());

        // If a peer asked us to probe this target, relay the good news.
        if let Some((target, origin)) = self.relay_origins.remove(&sender) {
            let self_address = self.self_address();
            self.transport
                .send_message(
                    Message::PingAck {
                        sender: self_address.clone(),
                        target,
                        helper: self_address,
                    },
                    &origin,
                )
                .await;
        }
    }

    async fn handle_ping(&self, sender: String) {
        if sender == self.self_address() {
            return;
        }
        self.ensure_alive(&sender, 0);
        self.transport
            .send_message(
                Message::Ack {
                    sender: self.self_address(),
                    target: sender.clone(),
                },
                &sender,
            )
            .await;
    }

    async fn handle_ping_req(&self, origin: String, target: String) {
        let self_address = self.self_address();
        if target == self_address {
            // We are the one being probed; answer the origin directly.
            self.transport
                .send_message(
                    Message::Ack {
                        sender: self_address,
                        target: origin.clone(),
                    },
                    &origin,
                )
                .await;
            return;
        }
        self.relay_origins.insert(target.clone(), origin);
        self.transport
            .send_message(
                Message::Ping {
                    sender: self_address,
                    target: target.clone(),
                },
                &target,
            )
            .await;
    }

    async fn handle_ping_ack(&self, target: String) {
        if target == self.self_address() {
            return;
        }
        let Some(member) = self.directory.get(&target) else {
            return;
        };
        self.directory.record_response(&target, crate::now_secs());
        self.directory.mark_alive(&target, member.incarnation);
    }

    async fn handle_suspect(&self, target: String, incarnation: u64) {
        let self_address = self.self_address();
        if target == self_address {
            // Refute: mint a fresh incarnation that outranks the suspicion.
            let next = self.directory.increment_self_incarnation();
            tracing::info!("Refuting suspicion with incarnation {}", next);
            self.broadcast(Message::Alive {
                sender: self_address.clone(),
                target: self_address,
                incarnation: next,
            })
            .await;
            return;
        }

        if self
            .directory
            .update_status(&target, MemberStatus::Suspect, incarnation)
        {
            // Propagate the delta once per transition so the suspicion (and
            // the target's chance to refute it) spreads infection-style.
            self.broadcast(Message::Suspect {
                sender: self_address,
                target: target.clone(),
                incarnation,
            })
            .await;
            self.indirect_ping(&target).await;
        }
    }

    async fn handle_alive(&self, target: String, incarnation: u64) {
        if target == self.self_address() {
            return;
        }
        if self.directory.contains(&target) {
            self.directory.mark_alive(&target, incarnation);
        } else {
            self.directory.add(Member::new(target, incarnation));
        }
    }

    async fn handle_dead(&self, target: String, incarnation: u64) {
        let self_address = self.self_address();
        if target == self_address {
            let next = self.directory.increment_self_incarnation();
            tracing::info!("Refuting death report with incarnation {}", next);
            self.broadcast(Message::Alive {
                sender: self_address.clone(),
                target: self_address,
                incarnation: next,
            })
            .await;
            return;
        }

        if self
            .directory
            .update_status(&target, MemberStatus::Dead, incarnation)
        {
            self.relay_origins.remove(&target);
            self.directory.remove(&target);
        }
    }

    fn handle_members(&self, members: Vec<String>) {
        let self_address = self.self_address();
        for address in members {
            if address != self_address && !self.directory.contains(&address) {
                self.directory.add(Member::new(address, 0));
            }
        }
    }
}

#[derive(Clone, Copy)]
enum TickKind {
    Probe,
    Sweep,
    Sync,
}
