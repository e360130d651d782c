//! Failure detection
//!
//! Two strategies behind one [`FailureDetector`] trait: a binary
//! [`FixedTimeoutDetector`] and the adaptive [`AccrualFailureDetector`].
//! Both read time from a [`Clock`](crate::common::Clock).

pub mod accrual;
pub mod fixed;
pub mod heartbeat;

pub use accrual::AccrualFailureDetector;
pub use fixed::FixedTimeoutDetector;
pub use heartbeat::{HeartbeatRecord, HeartbeatTracker};

use crate::common::{NodeId, NodeState};
use std::collections::HashSet;

pub trait FailureDetector: Send + Sync + std::fmt::Debug {
    /// Record a heartbeat from `peer` at the current time
    fn heartbeat(&self, peer: &str);

    /// Start monitoring `peer` before it has been heard from
    fn watch_peer(&self, peer: &str);

    /// Clock time of the last heartbeat from `peer`
    fn last_seen(&self, peer: &str) -> Option<u64>;

    /// Peers never heard from count as suspected
    fn is_suspected(&self, peer: &str) -> bool;

    /// Suspected peers among those that have sent at least one heartbeat
    fn check_all(&self) -> HashSet<NodeId>;

    fn peer_state(&self, peer: &str) -> NodeState {
        if self.last_seen(peer).is_none() {
            NodeState::Unknown
        } else if self.is_suspected(peer) {
            NodeState::Suspect
        } else {
            NodeState::Alive
        }
    }
}
