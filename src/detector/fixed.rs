//! Binary timeout detector

use super::heartbeat::HeartbeatTracker;
use super::FailureDetector;
use crate::common::utils::lock;
use crate::common::{Clock, DetectorConfig, NodeId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct FixedState {
    tracker: HeartbeatTracker,
    suspected: HashSet<NodeId>,
}

/// Suspects a peer whose last heartbeat is older than a fixed threshold
#[derive(Debug)]
pub struct FixedTimeoutDetector {
    clock: Arc<dyn Clock>,
    timeout_ms: u64,
    state: Mutex<FixedState>,
}

impl FixedTimeoutDetector {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            timeout_ms: timeout.as_millis() as u64,
            state: Mutex::new(FixedState {
                // only the last arrival matters here
                tracker: HeartbeatTracker::new(1),
                suspected: HashSet::new(),
            }),
        }
    }

    pub fn from_config(config: &DetectorConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.failure_timeout(), clock)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn expired(&self, last_seen: u64, now: u64) -> bool {
        now.saturating_sub(last_seen) > self.timeout_ms
    }
}

impl FailureDetector for FixedTimeoutDetector {
    fn heartbeat(&self, peer: &str) {
        let now = self.clock.now_millis();
        let mut state = lock(&self.state);
        state.tracker.record(peer, now);
        if state.suspected.remove(peer) {
            tracing::info!("Peer {} is alive again", peer);
        }
    }

    fn watch_peer(&self, peer: &str) {
        lock(&self.state).tracker.watch_peer(peer);
    }

    fn last_seen(&self, peer: &str) -> Option<u64> {
        lock(&self.state).tracker.get(peer).and_then(|r| r.last_seen)
    }

    fn is_suspected(&self, peer: &str) -> bool {
        let now = self.clock.now_millis();
        match self.last_seen(peer) {
            Some(last) => self.expired(last, now),
            None => true,
        }
    }

    fn check_all(&self) -> HashSet<NodeId> {
        let now = self.clock.now_millis();
        let mut state = lock(&self.state);
        let FixedState { tracker, suspected } = &mut *state;

        for record in tracker.records() {
            let Some(last) = record.last_seen else {
                continue;
            };
            if self.expired(last, now) {
                if suspected.insert(record.peer_id.clone()) {
                    tracing::warn!(
                        "Peer {} suspected: no heartbeat for {}ms",
                        record.peer_id,
                        now - last
                    );
                }
            } else {
                suspected.remove(&record.peer_id);
            }
        }
        suspected.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;
    use crate::common::NodeState;

    fn detector() -> (FixedTimeoutDetector, Arc<ManualClock>) {
        let clock = ManualClock::new(0);
        (
            FixedTimeoutDetector::new(Duration::from_millis(100), clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_suspect_after_timeout_and_recover() {
        let (fd, clock) = detector();
        fd.heartbeat("n1");
        fd.heartbeat("n2");

        clock.advance(Duration::from_millis(100));
        assert!(fd.check_all().is_empty());

        fd.heartbeat("n2");
        clock.advance(Duration::from_millis(1));
        let suspected = fd.check_all();
        assert!(suspected.contains("n1"));
        assert!(!suspected.contains("n2"));
        assert!(fd.is_suspected("n1"));

        fd.heartbeat("n1");
        assert!(!fd.is_suspected("n1"));
        assert!(fd.check_all().is_empty());
    }

    #[test]
    fn test_never_seen_peers() {
        let (fd, clock) = detector();
        fd.watch_peer("ghost");
        clock.advance(Duration::from_secs(10));
        assert!(fd.check_all().is_empty());
        assert!(fd.is_suspected("ghost"));
        assert_eq!(fd.peer_state("ghost"), NodeState::Unknown);

        fd.heartbeat("ghost");
        assert_eq!(fd.peer_state("ghost"), NodeState::Alive);
    }
}
