use super::{ReplicatedState, StateTransport};
use crate::common::utils::lock;
use crate::common::{quorum, Error, NodeId, ReplicationConfig, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Slot {
    state: ReplicatedState,
    /// A majority acknowledged this version
    confirmed: bool,
}

/// One node's replica plus the push side of replication
pub struct StateReplicator {
    id: NodeId,
    peers: Vec<NodeId>,
    config: ReplicationConfig,
    transport: Arc<dyn StateTransport>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for StateReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateReplicator")
            .field("id", &self.id)
            .field("peers", &self.peers)
            .field("keys", &lock(&self.slots).len())
            .finish()
    }
}

impl StateReplicator {
    pub fn new(
        id: impl Into<NodeId>,
        peers: Vec<NodeId>,
        config: ReplicationConfig,
        transport: Arc<dyn StateTransport>,
    ) -> Self {
        let id = id.into();
        let peers = peers.into_iter().filter(|p| *p != id).collect();
        Self {
            id,
            peers,
            config,
            transport,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// Write locally, then push to every peer
    ///
    /// Succeeds once a strict majority of the cluster (this node included)
    /// holds the new version. Otherwise returns `QuorumUnavailable`; the local
    /// write stays in place, marked unconfirmed.
    pub async fn update_state(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<ReplicatedState> {
        let state = {
            let mut slots = lock(&self.slots);
            let version = slots.get(key).map_or(0, |s| s.state.version) + 1;
            let state = ReplicatedState {
                key: key.to_string(),
                value,
                version,
            };
            slots.insert(
                key.to_string(),
                Slot {
                    state: state.clone(),
                    confirmed: false,
                },
            );
            state
        };

        let required = quorum(self.peers.len() + 1);
        let mut acks = 1;

        // pushes run as tasks so slow peers still get the value after quorum
        let mut pending: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|peer| {
                let transport = self.transport.clone();
                let peer = peer.clone();
                let state = state.clone();
                let timeout = self.config.ack_timeout();
                tokio::spawn(async move {
                    let result =
                        tokio::time::timeout(timeout, transport.push_state(&peer, state)).await;
                    (peer, result)
                })
            })
            .collect();

        while acks < required {
            let Some(joined) = pending.next().await else {
                break;
            };
            match joined {
                Ok((_, Ok(Ok(true)))) => acks += 1,
                Ok((peer, Ok(Ok(false)))) => {
                    tracing::debug!("Peer {} rejected {} v{}", peer, key, state.version)
                }
                Ok((peer, Ok(Err(e)))) => tracing::debug!("Push to {} failed: {}", peer, e),
                Ok((peer, Err(_))) => tracing::debug!("Push to {} timed out", peer),
                Err(e) => tracing::warn!("Push task failed: {}", e),
            }
        }

        if acks < required {
            tracing::warn!(
                "Update of {} v{} unconfirmed: {}/{} acks",
                key,
                state.version,
                acks,
                required
            );
            return Err(Error::QuorumUnavailable { acks, required });
        }

        if let Some(slot) = lock(&self.slots).get_mut(key) {
            if slot.state.version == state.version {
                slot.confirmed = true;
            }
        }
        Ok(state)
    }

    /// Accept a peer's value only if it is newer than ours
    pub fn apply_remote(&self, state: ReplicatedState) -> bool {
        match self.try_apply(state) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Node {} rejecting remote state: {}", self.id, e);
                false
            }
        }
    }

    /// Install a remote write unless it is not newer than ours
    fn try_apply(&self, state: ReplicatedState) -> Result<()> {
        let mut slots = lock(&self.slots);
        let current = slots.get(&state.key).map_or(0, |s| s.state.version);
        if state.version <= current {
            return Err(Error::StaleVersion {
                key: state.key,
                received: state.version,
                current,
            });
        }
        slots.insert(
            state.key.clone(),
            Slot {
                state,
                confirmed: true,
            },
        );
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<ReplicatedState> {
        lock(&self.slots).get(key).map(|s| s.state.clone())
    }

    /// Whether a majority acknowledged the current version of `key`
    pub fn is_confirmed(&self, key: &str) -> Option<bool> {
        lock(&self.slots).get(key).map(|s| s.confirmed)
    }

    /// Every key, ordered by key
    pub fn snapshot(&self) -> Vec<ReplicatedState> {
        let mut states: Vec<_> = lock(&self.slots)
            .values()
            .map(|s| s.state.clone())
            .collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));
        states
    }

    /// Replace the whole replica with a peer's snapshot
    ///
    /// Every adopted key counts as confirmed and keys the peer lacks are
    /// dropped. Returns how many keys changed, including dropped ones.
    pub fn adopt_snapshot(&self, states: Vec<ReplicatedState>) -> usize {
        let mut slots = lock(&self.slots);
        let previous = std::mem::take(&mut *slots);
        let mut changed = 0;
        for state in states {
            let same = previous
                .get(&state.key)
                .is_some_and(|old| old.confirmed && old.state == state);
            if !same {
                changed += 1;
            }
            slots.insert(
                state.key.clone(),
                Slot {
                    state,
                    confirmed: true,
                },
            );
        }
        let dropped: Vec<&String> = previous.keys().filter(|k| !slots.contains_key(*k)).collect();
        if !dropped.is_empty() {
            tracing::info!(
                "Node {} dropping {} keys missing from adopted snapshot",
                self.id,
                dropped.len()
            );
        }
        changed + dropped.len()
    }

    /// Merge a peer snapshot under the usual version rule; returns how many
    /// keys were updated
    pub fn install_snapshot(&self, states: Vec<ReplicatedState>) -> usize {
        states
            .into_iter()
            .filter(|state| self.apply_remote(state.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Peers that all accept, or all refuse
    struct FakePeers {
        accept: bool,
        pushes: AtomicUsize,
    }

    #[async_trait]
    impl StateTransport for FakePeers {
        async fn push_state(&self, to: &str, _state: ReplicatedState) -> Result<bool> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                Ok(true)
            } else {
                Err(Error::ConnectionFailed(to.to_string()))
            }
        }

        async fn fetch_snapshot(&self, from: &str) -> Result<Vec<ReplicatedState>> {
            Err(Error::ConnectionFailed(from.to_string()))
        }
    }

    fn replicator(accept: bool) -> (StateReplicator, Arc<FakePeers>) {
        let peers = Arc::new(FakePeers {
            accept,
            pushes: AtomicUsize::new(0),
        });
        let replicator = StateReplicator::new(
            "n1",
            vec!["n1".into(), "n2".into(), "n3".into()],
            ReplicationConfig::default(),
            peers.clone(),
        );
        (replicator, peers)
    }

    #[tokio::test]
    async fn test_update_with_quorum() {
        let (rep, peers) = replicator(true);
        let state = rep.update_state("x", json!(1)).await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(rep.is_confirmed("x"), Some(true));

        let state = rep.update_state("x", json!(2)).await.unwrap();
        assert_eq!(state.version, 2);
        assert!(peers.pushes.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_update_without_quorum_keeps_local_value() {
        let (rep, _) = replicator(false);
        match rep.update_state("x", json!("v")).await {
            Err(Error::QuorumUnavailable { acks, required }) => {
                assert_eq!(acks, 1);
                assert_eq!(required, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rep.get("x").unwrap().value, json!("v"));
        assert_eq!(rep.is_confirmed("x"), Some(false));
    }

    #[test]
    fn test_stale_remote_rejected() {
        let (rep, _) = replicator(true);
        let newer = ReplicatedState {
            key: "x".into(),
            value: json!(2),
            version: 2,
        };
        assert!(rep.apply_remote(newer.clone()));
        assert!(!rep.apply_remote(newer));
        assert!(!rep.apply_remote(ReplicatedState {
            key: "x".into(),
            value: json!(1),
            version: 1,
        }));
        assert_eq!(rep.get("x").unwrap().value, json!(2));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (a, _) = replicator(true);
        let (b, _) = replicator(true);
        for (key, version) in [("b", 3), ("a", 1)] {
            a.apply_remote(ReplicatedState {
                key: key.into(),
                value: json!(version),
                version,
            });
        }
        let snapshot = a.snapshot();
        assert_eq!(snapshot[0].key, "a");
        assert_eq!(b.install_snapshot(snapshot.clone()), 2);
        assert_eq!(b.install_snapshot(snapshot), 0);
        assert_eq!(b.get("b").unwrap().version, 3);
    }
}
