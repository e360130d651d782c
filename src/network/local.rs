use crate::common::utils::lock;
use crate::common::{Error, NodeId, Result};
use crate::consensus::{
    AppendRequest, AppendResponse, Heartbeat, RaftNode, RaftTransport, VoteRequest, VoteResponse,
};
use crate::replication::{ReplicatedState, StateReplicator, StateTransport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[derive(Default)]
struct Links {
    /// Directed links that drop every message
    cut: HashSet<(NodeId, NodeId)>,
    /// Nodes that can neither send nor receive
    isolated: HashSet<NodeId>,
    latency: Duration,
}

impl Links {
    fn connected(&self, from: &str, to: &str) -> bool {
        !self.isolated.contains(from)
            && !self.isolated.contains(to)
            && !self.cut.contains(&(from.to_string(), to.to_string()))
    }
}

/// Message router between in-process nodes
///
/// Nodes are held weakly, so dropping the last handle to a node takes it off
/// the network just like a crash would.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: Mutex<HashMap<NodeId, Weak<RaftNode>>>,
    replicators: Mutex<HashMap<NodeId, Weak<StateReplicator>>>,
    links: Mutex<Links>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let links = lock(&self.links);
        f.debug_struct("LocalNetwork")
            .field("nodes", &lock(&self.nodes).len())
            .field("cut", &links.cut.len())
            .field("isolated", &links.isolated)
            .finish()
    }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport used by node `from`
    pub fn transport(self: &Arc<Self>, from: impl Into<NodeId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            from: from.into(),
        })
    }

    /// Make `node` reachable under its id, replacing any earlier registration
    pub fn register_node(&self, node: &Arc<RaftNode>) {
        lock(&self.nodes).insert(node.id().to_string(), Arc::downgrade(node));
    }

    pub fn register_replicator(&self, replicator: &Arc<StateReplicator>) {
        lock(&self.replicators).insert(replicator.id().to_string(), Arc::downgrade(replicator));
    }

    pub fn unregister(&self, id: &str) {
        lock(&self.nodes).remove(id);
        lock(&self.replicators).remove(id);
    }

    /// Cut `id` off from every other node
    pub fn isolate(&self, id: &str) {
        lock(&self.links).isolated.insert(id.to_string());
        tracing::info!("Isolated {}", id);
    }

    /// Drop messages from `from` to `to` only
    pub fn cut_link(&self, from: &str, to: &str) {
        lock(&self.links)
            .cut
            .insert((from.to_string(), to.to_string()));
        tracing::debug!("Cut link {} -> {}", from, to);
    }

    /// Split the cluster; nodes talk only within their own group
    pub fn partition(&self, groups: &[&[&str]]) {
        let mut links = lock(&self.links);
        for (i, left) in groups.iter().enumerate() {
            for (j, right) in groups.iter().enumerate() {
                if i == j {
                    continue;
                }
                for a in left.iter() {
                    for b in right.iter() {
                        links.cut.insert((a.to_string(), b.to_string()));
                    }
                }
            }
        }
        tracing::info!("Partitioned into {:?}", groups);
    }

    /// Restore every link
    pub fn heal(&self) {
        let mut links = lock(&self.links);
        links.cut.clear();
        links.isolated.clear();
        tracing::info!("Network healed");
    }

    /// Per-message delivery delay
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.links).latency = latency;
    }

    pub fn is_connected(&self, from: &str, to: &str) -> bool {
        lock(&self.links).connected(from, to)
    }

    /// Simulate the hop from `from` to `to`
    async fn deliver(&self, from: &str, to: &str) -> Result<()> {
        let latency = {
            let links = lock(&self.links);
            if !links.connected(from, to) {
                return Err(Error::ConnectionFailed(format!("{} -> {} unreachable", from, to)));
            }
            links.latency
        };
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn node(&self, id: &str) -> Result<Arc<RaftNode>> {
        lock(&self.nodes)
            .get(id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ConnectionFailed(format!("no node {}", id)))
    }

    fn replicator(&self, id: &str) -> Result<Arc<StateReplicator>> {
        lock(&self.replicators)
            .get(id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ConnectionFailed(format!("no replicator {}", id)))
    }
}

/// One node's view of a [`LocalNetwork`]
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: NodeId,
}

impl LocalTransport {
    pub fn local_id(&self) -> &str {
        &self.from
    }

    /// Deliver, call, then check the reply path is still up
    async fn round_trip<T>(&self, to: &str, call: impl FnOnce() -> Result<T>) -> Result<T> {
        self.network.deliver(&self.from, to).await?;
        let reply = call()?;
        self.network.deliver(to, &self.from).await?;
        Ok(reply)
    }
}

#[async_trait]
impl RaftTransport for LocalTransport {
    async fn request_vote(&self, to: &str, req: VoteRequest) -> Result<VoteResponse> {
        let node = self.network.node(to)?;
        self.round_trip(to, || node.request_vote(req)).await
    }

    async fn append_entries(&self, to: &str, req: AppendRequest) -> Result<AppendResponse> {
        let node = self.network.node(to)?;
        self.round_trip(to, || node.append_entries(req)).await
    }

    async fn heartbeat(&self, to: &str, heartbeat: Heartbeat) {
        let Ok(node) = self.network.node(to) else {
            return;
        };
        if self.network.deliver(&self.from, to).await.is_ok() {
            node.receive_heartbeat(heartbeat);
        }
    }
}

#[async_trait]
impl StateTransport for LocalTransport {
    async fn push_state(&self, to: &str, state: ReplicatedState) -> Result<bool> {
        let replicator = self.network.replicator(to)?;
        self.round_trip(to, || Ok(replicator.apply_remote(state)))
            .await
    }

    async fn fetch_snapshot(&self, from: &str) -> Result<Vec<ReplicatedState>> {
        let replicator = self.network.replicator(from)?;
        self.round_trip(from, || Ok(replicator.snapshot())).await
    }
}
