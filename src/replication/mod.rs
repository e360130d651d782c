//! Versioned state replication and peer recovery
//!
//! Each node keeps its own replica of a key/value map. Local writes bump the
//! key's version and are pushed to peers; a peer accepts a pushed value only if
//! its version is newer than what it holds. A rejoining node pulls a snapshot
//! from any reachable peer.

pub mod recovery;
pub mod replicator;

pub use recovery::{RecoveryManager, RecoveryState};
pub use replicator::StateReplicator;

use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedState {
    pub key: String,
    pub value: serde_json::Value,
    /// Strictly increasing per key
    pub version: u64,
}

/// Peer boundary for state replication
#[async_trait]
pub trait StateTransport: Send + Sync {
    /// Offer `state` to `to`; `Ok(true)` if the peer applied it
    async fn push_state(&self, to: &str, state: ReplicatedState) -> Result<bool>;

    /// Full replica of `from`
    async fn fetch_snapshot(&self, from: &str) -> Result<Vec<ReplicatedState>>;
}
