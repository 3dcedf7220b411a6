use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::types::{Member, MemberEvent, MemberStatus, TimeoutTransition};
use crate::config::NodeConfig;

/// Callback invoked for every membership change.
pub type MemberSubscriber = Arc<dyn Fn(&MemberEvent) + Send + Sync>;

/// Thread-safe membership table.
///
/// Holds every known member including self; peer-view queries always
/// exclude self. Mutations go through the concurrent map's per-entry locks,
/// and events are dispatched only after the touched entry is released so a
/// subscriber can call back into the directory without deadlocking.
pub struct Directory {
    self_address: String,
    /// Self incarnation lives here as well as in the member entry; the
    /// atomic is the mint, the entry mirrors it for snapshots.
    self_incarnation: AtomicU64,
    members: DashMap<String, Member>,
    subscribers: RwLock<Vec<MemberSubscriber>>,
}

impl Directory {
    pub fn new(self_address: impl Into<String>) -> Self {
        let self_address = self_address.into();
        let members = DashMap::new();
        members.insert(self_address.clone(), Member::new(self_address.clone(), 0));
        Self {
            self_address,
            self_incarnation: AtomicU64::new(0),
            members,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    pub fn self_incarnation(&self) -> u64 {
        self.self_incarnation.load(Ordering::SeqCst)
    }

    /// Mints the next incarnation for self, used to refute suspicion.
    /// Only the owner of an address ever increments its incarnation.
    pub fn increment_self_incarnation(&self) -> u64 {
        let next = self.self_incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(mut me) = self.members.get_mut(&self.self_address) {
            me.incarnation = next;
        }
        next
    }

    pub fn subscribe(&self, subscriber: MemberSubscriber) {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(subscriber);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.members.contains_key(address)
    }

    /// Immutable snapshot of one member.
    pub fn get(&self, address: &str) -> Option<Member> {
        self.members.get(address).map(|m| m.clone())
    }

    /// Inserts a member if its address is unknown. Idempotent: a second add
    /// for the same address changes nothing and emits no event.
    pub fn add(&self, member: Member) -> bool {
        let address = member.address.clone();
        let inserted = match self.members.entry(address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(member);
                true
            }
        };
        if inserted {
            tracing::info!("Member joined: {}", address);
            self.dispatch(&MemberEvent::Joined { address });
        }
        inserted
    }

    /// Removes a member. Idempotent: unknown addresses return `None`.
    pub fn remove(&self, address: &str) -> Option<Member> {
        if address == self.self_address {
            return None;
        }
        let (_, member) = self.members.remove(address)?;
        tracing::info!("Member left: {} (was {:?})", address, member.status);
        self.dispatch(&MemberEvent::Left {
            address: address.to_string(),
            last_status: member.status,
        });
        Some(member)
    }

    /// Applies a remotely observed status at an incarnation, following the
    /// severity rule: never downgrades at equal incarnation. Returns whether
    /// the member changed.
    pub fn update_status(
        &self,
        address: &str,
        new_status: MemberStatus,
        incarnation: u64,
    ) -> bool {
        let event = {
            let Some(mut member) = self.members.get_mut(address) else {
                return false;
            };
            let old_status = member.status;
            if !member.update(new_status, incarnation) {
                return false;
            }
            status_event(address, old_status, member.status)
        };
        if let Some(event) = &event {
            self.dispatch(event);
        }
        true
    }

    /// Restores a suspect (or newly-outdated dead) member to alive, the
    /// refutation path. Returns whether a recovery happened.
    pub fn mark_alive(&self, address: &str, incarnation: u64) -> bool {
        let recovered = {
            let Some(mut member) = self.members.get_mut(address) else {
                return false;
            };
            member.mark_alive(incarnation)
        };
        if recovered {
            tracing::info!("Member recovered: {}", address);
            self.dispatch(&MemberEvent::Recovered {
                address: address.to_string(),
            });
        }
        recovered
    }

    /// Notes a successful ack from a member, clearing its pending probe.
    pub fn record_response(&self, address: &str, now: f64) {
        if let Some(mut member) = self.members.get_mut(address) {
            member.record_response(now);
        }
    }

    /// Stamps an outstanding probe on a member.
    pub fn set_pending_ping(&self, address: &str, now: f64) {
        if let Some(mut member) = self.members.get_mut(address) {
            member.pending_ping_at = Some(now);
        }
    }

    /// Runs the timeout ladder over every peer and returns the transitions
    /// that fired, for the sweep to disseminate. Suspected / Failed events
    /// are dispatched here; removal of expired entries is the caller's call.
    pub fn check_timeouts(&self, now: f64, config: &NodeConfig) -> Vec<(Member, TimeoutTransition)> {
        let ping_timeout = config.ping_timeout.as_secs_f64();
        let suspect_timeout = config.suspect_timeout.as_secs_f64();
        let dead_timeout = config.dead_timeout.as_secs_f64();

        let mut transitions = Vec::new();
        for mut entry in self.members.iter_mut() {
            if entry.key() == &self.self_address {
                continue;
            }
            if let Some(transition) =
                entry.check_timeouts(now, ping_timeout, suspect_timeout, dead_timeout)
            {
                transitions.push((entry.clone(), transition));
            }
        }

        for (member, transition) in &transitions {
            match transition {
                TimeoutTransition::Suspected => {
                    tracing::warn!(
                        "Member suspected: {} (inc={})",
                        member.address,
                        member.incarnation
                    );
                    self.dispatch(&MemberEvent::Suspected {
                        address: member.address.clone(),
                    });
                }
                TimeoutTransition::Failed => {
                    tracing::warn!(
                        "Member failed: {} (inc={})",
                        member.address,
                        member.incarnation
                    );
                    self.dispatch(&MemberEvent::Failed {
                        address: member.address.clone(),
                    });
                }
                TimeoutTransition::Expired => {}
            }
        }
        transitions
    }

    /// Every known address, self included. This is the `members` reply to a
    /// join.
    pub fn addresses(&self) -> Vec<String> {
        self.members.iter().map(|m| m.key().clone()).collect()
    }

    /// Snapshot of every member, self included.
    pub fn members_snapshot(&self) -> Vec<Member> {
        self.members.iter().map(|m| m.clone()).collect()
    }

    /// All peers (self excluded), whatever their status.
    pub fn peers(&self) -> Vec<Member> {
        self.members
            .iter()
            .filter(|m| m.key() != &self.self_address)
            .map(|m| m.clone())
            .collect()
    }

    fn peers_with_status(&self, status: MemberStatus) -> Vec<Member> {
        self.members
            .iter()
            .filter(|m| m.key() != &self.self_address && m.status == status)
            .map(|m| m.clone())
            .collect()
    }

    pub fn alive_peers(&self) -> Vec<Member> {
        self.peers_with_status(MemberStatus::Alive)
    }

    pub fn suspect_peers(&self) -> Vec<Member> {
        self.peers_with_status(MemberStatus::Suspect)
    }

    pub fn dead_peers(&self) -> Vec<Member> {
        self.peers_with_status(MemberStatus::Dead)
    }

    /// Dissemination fan-out: every peer not known to be dead.
    pub fn broadcast_targets(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.key() != &self.self_address && m.status != MemberStatus::Dead)
            .map(|m| m.key().clone())
            .collect()
    }

    fn dispatch(&self, event: &MemberEvent) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for subscriber in &subscribers {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| subscriber(event)));
            if result.is_err() {
                tracing::error!("Member subscriber panicked on {:?}", event);
            }
        }
    }
}

/// Maps a status transition to its subscription event, if any.
fn status_event(
    address: &str,
    old_status: MemberStatus,
    new_status: MemberStatus,
) -> Option<MemberEvent> {
    if old_status == new_status {
        return None;
    }
    match new_status {
        MemberStatus::Suspect => Some(MemberEvent::Suspected {
            address: address.to_string(),
        }),
        MemberStatus::Dead => Some(MemberEvent::Failed {
            address: address.to_string(),
        }),
        MemberStatus::Alive => Some(MemberEvent::Recovered {
            address: address.to_string(),
        }),
    }
}
