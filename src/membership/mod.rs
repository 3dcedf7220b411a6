//! Membership Module
//!
//! The failure detector and membership directory at the heart of the
//! cluster. Peers are probed with a SWIM-style ping / ping-req / ack
//! exchange; verdicts spread epidemically through suspect / alive / dead
//! dissemination messages.
//!
//! ## Core Mechanisms
//! - **Direct and indirect probing**: each probe tick pings one random
//!   peer; a missed reply triggers an indirect probe through helper peers
//!   before the target is declared suspect cluster-wide.
//! - **Incarnation numbers**: a per-member logical clock minted only by the
//!   member itself. A node that hears it is suspected bumps its own
//!   incarnation and broadcasts an alive refutation that outranks the
//!   suspicion everywhere.
//! - **Lifecycle**: alive -> suspect -> dead, with severity never moving
//!   backwards at equal incarnation except through explicit refutation.

pub mod directory;
pub mod service;
pub mod types;

pub use directory::Directory;
pub use service::SwimService;
pub use types::{Member, MemberEvent, MemberStatus};
