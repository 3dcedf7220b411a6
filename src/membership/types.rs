use serde::{Deserialize, Serialize};

/// Lifecycle state of a member as seen by the local failure detector.
///
/// The derived ordering is the severity order used for conflict resolution:
/// at equal incarnation a member's status only ever moves towards higher
/// severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Healthy and responsive.
    Alive,
    /// Missed a probe window; can refute back to alive or time out to dead.
    Suspect,
    /// Confirmed failed. Terminal: the entry is announced and removed.
    Dead,
}

/// One peer in the cluster.
///
/// Identified by its immutable `"host:port"` address. The incarnation is a
/// logical clock minted only by the member itself; observers absorb higher
/// values but never invent them. Timing fields are wall-clock epoch seconds
/// and are local bookkeeping, never sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub address: String,
    pub incarnation: u64,
    pub status: MemberStatus,
    /// When the status last changed, driving the suspect and dead timers.
    #[serde(skip)]
    pub last_state_change_at: f64,
    /// When this member last answered any probe.
    #[serde(skip)]
    pub last_response_at: f64,
    /// Set while a direct probe awaits a reply; cleared by any ack and by
    /// every status transition.
    #[serde(skip)]
    pub pending_ping_at: Option<f64>,
}

/// Result of a timeout check, reported to the sweep so it can disseminate
/// the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutTransition {
    /// Alive member missed its probe window; now suspect.
    Suspected,
    /// Suspect member ran out its grace period; now dead.
    Failed,
    /// Dead entry lingered past the removal grace; eligible for sweep-out.
    Expired,
}

impl Member {
    pub fn new(address: impl Into<String>, incarnation: u64) -> Self {
        let now = crate::now_secs();
        Self {
            address: address.into(),
            incarnation,
            status: MemberStatus::Alive,
            last_state_change_at: now,
            last_response_at: now,
            pending_ping_at: None,
        }
    }

    /// Applies a remotely observed `(status, incarnation)` pair.
    ///
    /// The pair wins iff the incarnation is strictly newer, or it is equal
    /// and the severity strictly higher. Returns whether anything changed.
    /// Every status transition clears the pending probe.
    pub fn update(&mut self, new_status: MemberStatus, new_incarnation: u64) -> bool {
        let newer = new_incarnation > self.incarnation
            || (new_incarnation == self.incarnation && new_status > self.status);
        if !newer {
            return false;
        }

        let status_changed = new_status != self.status;
        self.incarnation = new_incarnation;
        self.status = new_status;
        if status_changed {
            self.last_state_change_at = crate::now_secs();
            self.pending_ping_at = None;
        }
        true
    }

    /// Restores a suspect member to alive.
    ///
    /// This is the one sanctioned severity downgrade: direct evidence (an
    /// ack) or an alive message at the current-or-newer incarnation clears
    /// the suspicion. Returns whether the member recovered.
    pub fn mark_alive(&mut self, incarnation: u64) -> bool {
        if incarnation > self.incarnation {
            let recovered = self.status != MemberStatus::Alive;
            self.incarnation = incarnation;
            if self.status != MemberStatus::Alive {
                self.status = MemberStatus::Alive;
                self.last_state_change_at = crate::now_secs();
                self.pending_ping_at = None;
            }
            return recovered;
        }
        if incarnation == self.incarnation && self.status == MemberStatus::Suspect {
            self.status = MemberStatus::Alive;
            self.last_state_change_at = crate::now_secs();
            self.pending_ping_at = None;
            return true;
        }
        false
    }

    /// Records a successful ack from this member.
    pub fn record_response(&mut self, now: f64) {
        self.last_response_at = now;
        self.pending_ping_at = None;
    }

    /// Advances the timeout ladder, mutating status where a timer ran out.
    ///
    /// At most one transition happens per call; the sweep naturally walks a
    /// failing member down alive -> suspect -> dead across its ticks.
    pub fn check_timeouts(
        &mut self,
        now: f64,
        ping_timeout: f64,
        suspect_timeout: f64,
        dead_timeout: f64,
    ) -> Option<TimeoutTransition> {
        match self.status {
            MemberStatus::Alive => match self.pending_ping_at {
                Some(sent_at) if now - sent_at > ping_timeout => {
                    self.status = MemberStatus::Suspect;
                    self.last_state_change_at = now;
                    self.pending_ping_at = None;
                    Some(TimeoutTransition::Suspected)
                }
                _ => None,
            },
            MemberStatus::Suspect => {
                if now - self.last_state_change_at > suspect_timeout {
                    self.status = MemberStatus::Dead;
                    self.last_state_change_at = now;
                    self.pending_ping_at = None;
                    Some(TimeoutTransition::Failed)
                } else {
                    None
                }
            }
            MemberStatus::Dead => {
                if now - self.last_state_change_at > dead_timeout {
                    Some(TimeoutTransition::Expired)
                } else {
                    None
                }
            }
        }
    }
}

/// Directory subscription events, dispatched outside the member table lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    /// A new address entered the directory.
    Joined { address: String },
    /// An address was removed; carries its final status.
    Left {
        address: String,
        last_status: MemberStatus,
    },
    /// A member turned suspect.
    Suspected { address: String },
    /// A member was confirmed dead.
    Failed { address: String },
    /// A suspect member refuted and is alive again.
    Recovered { address: String },
}

impl MemberEvent {
    pub fn address(&self) -> &str {
        match self {
            MemberEvent::Joined { address }
            | MemberEvent::Left { address, .. }
            | MemberEvent::Suspected { address }
            | MemberEvent::Failed { address }
            | MemberEvent::Recovered { address } => address,
        }
    }
}
