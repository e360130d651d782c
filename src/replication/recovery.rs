use super::{ReplicatedState, StateReplicator, StateTransport};
use crate::common::utils::lock;
use crate::common::{quorum, Error, ReplicationConfig, Result};
use crate::detector::FailureDetector;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    /// Replica is serving and in contact with a majority
    Synced,
    /// Snapshot fetch in progress
    Recovering,
    /// Cut off from a majority, or the last recovery failed
    AwaitingState,
}

impl std::fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryState::Synced => write!(f, "synced"),
            RecoveryState::Recovering => write!(f, "recovering"),
            RecoveryState::AwaitingState => write!(f, "awaiting-state"),
        }
    }
}

/// Brings a restarted or partitioned replica back in line with its peers
pub struct RecoveryManager {
    replicator: Arc<StateReplicator>,
    transport: Arc<dyn StateTransport>,
    detector: Option<Arc<dyn FailureDetector>>,
    config: ReplicationConfig,
    state: Mutex<RecoveryState>,
}

impl RecoveryManager {
    pub fn new(
        replicator: Arc<StateReplicator>,
        transport: Arc<dyn StateTransport>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            replicator,
            transport,
            detector: None,
            config,
            state: Mutex::new(RecoveryState::Synced),
        }
    }

    /// Skip suspected peers during recovery and enable partition checks
    pub fn with_detector(mut self, detector: Arc<dyn FailureDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn state(&self) -> RecoveryState {
        *lock(&self.state)
    }

    fn set_state(&self, next: RecoveryState) {
        let mut state = lock(&self.state);
        if *state != next {
            tracing::info!(
                "Node {} recovery state {} -> {}",
                self.replicator.id(),
                *state,
                next
            );
            *state = next;
        }
    }

    fn is_suspected(&self, peer: &str) -> bool {
        self.detector
            .as_ref()
            .is_some_and(|detector| detector.is_suspected(peer))
    }

    /// Pull a snapshot from the first peer that answers and adopt it
    ///
    /// Peers are asked concurrently. The replica is replaced by the snapshot,
    /// including diverged local writes. Returns the number of keys changed. When
    /// no peer answers, the replica is left in `AwaitingState`.
    pub async fn recover_state(&self) -> Result<usize> {
        self.set_state(RecoveryState::Recovering);

        let candidates: Vec<_> = self
            .replicator
            .peers()
            .iter()
            .filter(|peer| !self.is_suspected(peer))
            .cloned()
            .collect();

        if candidates.is_empty() {
            self.set_state(RecoveryState::AwaitingState);
            return Err(Error::RecoveryFailed("no reachable peers".into()));
        }

        let timeout = self.config.recovery_timeout();
        let mut pending: FuturesUnordered<_> = candidates
            .iter()
            .map(|peer| async move {
                let result =
                    tokio::time::timeout(timeout, self.transport.fetch_snapshot(peer)).await;
                (peer, result)
            })
            .collect();

        let mut snapshot: Option<(String, Vec<ReplicatedState>)> = None;
        while let Some((peer, result)) = pending.next().await {
            match result {
                Ok(Ok(states)) => {
                    snapshot = Some((peer.clone(), states));
                    break;
                }
                Ok(Err(e)) => tracing::debug!("Snapshot from {} failed: {}", peer, e),
                Err(_) => tracing::debug!("Snapshot from {} timed out", peer),
            }
        }
        drop(pending);

        let Some((source, states)) = snapshot else {
            self.set_state(RecoveryState::AwaitingState);
            return Err(Error::RecoveryFailed(format!(
                "none of {} peers answered",
                candidates.len()
            )));
        };

        let total = states.len();
        let updated = self.replicator.adopt_snapshot(states);
        tracing::info!(
            "Node {} recovered {} of {} keys from {}",
            self.replicator.id(),
            updated,
            total,
            source
        );
        self.set_state(RecoveryState::Synced);
        Ok(updated)
    }

    /// Re-evaluate reachability against the failure detector
    ///
    /// Enters `AwaitingState` once this node plus its unsuspected peers no
    /// longer form a majority. Leaving that state takes a successful
    /// [`recover_state`](Self::recover_state).
    pub fn check_partition(&self) -> RecoveryState {
        let peers = self.replicator.peers();
        let reachable = 1 + peers.iter().filter(|p| !self.is_suspected(p)).count();
        if reachable < quorum(peers.len() + 1) {
            if self.state() != RecoveryState::AwaitingState {
                tracing::warn!(
                    "Node {} reaches {} of {} members, awaiting state",
                    self.replicator.id(),
                    reachable,
                    peers.len() + 1
                );
            }
            self.set_state(RecoveryState::AwaitingState);
        }
        self.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ManualClock, NodeId};
    use crate::detector::FixedTimeoutDetector;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Snapshot source keyed by peer; missing peers fail
    struct Snapshots(HashMap<NodeId, Vec<ReplicatedState>>);

    #[async_trait]
    impl StateTransport for Snapshots {
        async fn push_state(&self, to: &str, _state: ReplicatedState) -> Result<bool> {
            Err(Error::ConnectionFailed(to.to_string()))
        }

        async fn fetch_snapshot(&self, from: &str) -> Result<Vec<ReplicatedState>> {
            self.0
                .get(from)
                .cloned()
                .ok_or_else(|| Error::ConnectionFailed(from.to_string()))
        }
    }

    fn manager(sources: &[(&str, Vec<ReplicatedState>)]) -> RecoveryManager {
        let transport = Arc::new(Snapshots(
            sources
                .iter()
                .map(|(peer, states)| (peer.to_string(), states.clone()))
                .collect(),
        ));
        let replicator = Arc::new(StateReplicator::new(
            "n1",
            vec!["n2".into(), "n3".into()],
            ReplicationConfig::default(),
            transport.clone(),
        ));
        RecoveryManager::new(replicator, transport, ReplicationConfig::default())
    }

    fn state(key: &str, version: u64) -> ReplicatedState {
        ReplicatedState {
            key: key.into(),
            value: json!(version),
            version,
        }
    }

    #[tokio::test]
    async fn test_recover_from_any_peer() {
        let manager = manager(&[("n3", vec![state("a", 2), state("b", 1)])]);
        assert_eq!(manager.recover_state().await.unwrap(), 2);
        assert_eq!(manager.state(), RecoveryState::Synced);
        assert_eq!(manager.replicator.get("a").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_recovery_replaces_diverged_writes() {
        let majority = ReplicatedState {
            key: "x".into(),
            value: json!("majority"),
            version: 2,
        };
        let manager = manager(&[("n2", vec![majority.clone()])]);
        let replica = &manager.replicator;

        // writes made while cut off never reach a majority
        assert!(replica.update_state("x", json!("first")).await.is_err());
        assert!(replica.update_state("x", json!("minority")).await.is_err());
        assert!(replica.update_state("local-only", json!(1)).await.is_err());
        assert_eq!(replica.get("x").unwrap().version, 2);
        assert_eq!(replica.is_confirmed("x"), Some(false));

        assert_eq!(manager.recover_state().await.unwrap(), 2);
        assert_eq!(manager.state(), RecoveryState::Synced);
        assert_eq!(replica.get("x").unwrap(), majority);
        assert_eq!(replica.is_confirmed("x"), Some(true));
        assert!(replica.get("local-only").is_none());

        // nothing changes when the same snapshot is adopted again
        assert_eq!(manager.recover_state().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_fails_without_peers() {
        let manager = manager(&[]);
        assert!(matches!(
            manager.recover_state().await,
            Err(Error::RecoveryFailed(_))
        ));
        assert_eq!(manager.state(), RecoveryState::AwaitingState);
    }

    #[tokio::test]
    async fn test_partition_and_suspected_peers() {
        let clock = ManualClock::new(0);
        let detector = Arc::new(FixedTimeoutDetector::new(
            Duration::from_millis(100),
            clock.clone(),
        ));
        detector.heartbeat("n2");
        detector.heartbeat("n3");

        let manager = manager(&[("n2", vec![state("a", 1)])]).with_detector(detector.clone());
        assert_eq!(manager.check_partition(), RecoveryState::Synced);

        clock.advance(Duration::from_millis(500));
        detector.check_all();
        assert_eq!(manager.check_partition(), RecoveryState::AwaitingState);

        // every peer suspected: nothing to ask
        assert!(manager.recover_state().await.is_err());

        detector.heartbeat("n2");
        assert_eq!(manager.recover_state().await.unwrap(), 1);
        assert_eq!(manager.state(), RecoveryState::Synced);
    }
}
