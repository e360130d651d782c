//! Whole cluster wired over one [`LocalNetwork`]

use super::local::LocalNetwork;
use crate::common::{
    Config, ConsensusConfig, DetectorConfig, NodeId, ReplicationConfig, Result, TokioClock,
};
use crate::consensus::{
    start_raft_tasks, CommandLog, FileLogStorage, LogStorage, MemoryLogStorage, RaftNode,
};
use crate::detector::{AccrualFailureDetector, FailureDetector};
use crate::replication::{RecoveryManager, StateReplicator};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Where a member keeps its log; survives crashes, like a disk would
enum LogSource {
    Memory(MemoryLogStorage),
    File(PathBuf),
}

impl LogSource {
    fn open(&self) -> Result<Box<dyn LogStorage>> {
        let storage: Box<dyn LogStorage> = match self {
            LogSource::Memory(storage) => Box::new(storage.clone()),
            LogSource::File(path) => Box::new(FileLogStorage::open(path, true)?),
        };
        Ok(storage)
    }
}

struct Member {
    storage: LogSource,
    running: Option<Running>,
}

struct Running {
    node: Arc<RaftNode>,
    commands: Arc<CommandLog>,
    replicator: Arc<StateReplicator>,
    detector: Option<Arc<dyn FailureDetector>>,
    task: JoinHandle<()>,
}

/// In-process cluster of consensus nodes and state replicas
///
/// Node ids are `node-1` .. `node-N`.
pub struct LocalCluster {
    network: Arc<LocalNetwork>,
    ids: Vec<NodeId>,
    consensus: ConsensusConfig,
    detector: Option<DetectorConfig>,
    replication: ReplicationConfig,
    members: BTreeMap<NodeId, Member>,
}

impl LocalCluster {
    /// Start `size` nodes driven by election timers only, logging in memory
    pub fn start(size: usize, consensus: ConsensusConfig) -> Result<Self> {
        Self::build(size, consensus, None, ReplicationConfig::default(), None)
    }

    /// Start `size` nodes, each watching its peers with an accrual detector
    ///
    /// With `data_dir` set, node `id` logs to `<data_dir>/<id>/raft.log`.
    pub fn start_with_config(size: usize, config: &Config) -> Result<Self> {
        Self::build(
            size,
            config.consensus.clone(),
            Some(config.detector.clone()),
            config.replication.clone(),
            config.data_dir.as_deref(),
        )
    }

    fn build(
        size: usize,
        consensus: ConsensusConfig,
        detector: Option<DetectorConfig>,
        replication: ReplicationConfig,
        data_dir: Option<&Path>,
    ) -> Result<Self> {
        let ids: Vec<NodeId> = (1..=size).map(|i| format!("node-{}", i)).collect();
        let mut cluster = Self {
            network: LocalNetwork::new(),
            ids: ids.clone(),
            consensus,
            detector,
            replication,
            members: BTreeMap::new(),
        };
        for id in ids {
            cluster.members.insert(
                id.clone(),
                Member {
                    storage: match data_dir {
                        Some(dir) => LogSource::File(dir.join(&id).join("raft.log")),
                        None => LogSource::Memory(MemoryLogStorage::new()),
                    },
                    running: None,
                },
            );
            cluster.boot(&id)?;
        }
        tracing::info!("Started local cluster of {}", size);
        Ok(cluster)
    }

    fn boot(&mut self, id: &str) -> Result<()> {
        let Some(member) = self.members.get_mut(id) else {
            return Err(crate::Error::NotFound(id.to_string()));
        };
        let transport = self.network.transport(id);
        let commands = Arc::new(CommandLog::new());

        let mut node = RaftNode::new(
            id,
            self.ids.clone(),
            self.consensus.clone(),
            member.storage.open()?,
            transport.clone(),
        )?
        .with_state_machine(commands.clone());

        let detector = self.detector.as_ref().map(|config| {
            Arc::new(AccrualFailureDetector::from_config(config, TokioClock::shared()))
                as Arc<dyn FailureDetector>
        });
        if let Some(detector) = &detector {
            node = node.with_detector(detector.clone());
        }
        let node = Arc::new(node);

        let replicator = Arc::new(StateReplicator::new(
            id,
            self.ids.clone(),
            self.replication.clone(),
            transport,
        ));

        self.network.register_node(&node);
        self.network.register_replicator(&replicator);
        let task = start_raft_tasks(&node);

        member.running = Some(Running {
            node,
            commands,
            replicator,
            detector,
            task,
        });
        Ok(())
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    fn running(&self, id: &str) -> Option<&Running> {
        self.members.get(id).and_then(|m| m.running.as_ref())
    }

    /// `None` while the node is crashed
    pub fn node(&self, id: &str) -> Option<Arc<RaftNode>> {
        self.running(id).map(|r| r.node.clone())
    }

    /// Every running node
    pub fn nodes(&self) -> Vec<Arc<RaftNode>> {
        self.members
            .values()
            .filter_map(|m| m.running.as_ref().map(|r| r.node.clone()))
            .collect()
    }

    /// Commands applied by `id` since its last (re)start
    pub fn applied(&self, id: &str) -> Vec<Vec<u8>> {
        self.running(id)
            .map(|r| r.commands.applied())
            .unwrap_or_default()
    }

    pub fn replicator(&self, id: &str) -> Option<Arc<StateReplicator>> {
        self.running(id).map(|r| r.replicator.clone())
    }

    pub fn detector(&self, id: &str) -> Option<Arc<dyn FailureDetector>> {
        self.running(id).and_then(|r| r.detector.clone())
    }

    /// Recovery manager for `id`, sharing its replica and detector
    pub fn recovery_manager(&self, id: &str) -> Option<RecoveryManager> {
        let running = self.running(id)?;
        let manager = RecoveryManager::new(
            running.replicator.clone(),
            self.network.transport(id),
            self.replication.clone(),
        );
        Some(match &running.detector {
            Some(detector) => manager.with_detector(detector.clone()),
            None => manager,
        })
    }

    /// Running nodes that currently believe they lead
    pub fn leaders(&self) -> Vec<Arc<RaftNode>> {
        self.nodes().into_iter().filter(|n| n.is_leader()).collect()
    }

    /// Wait for a leader in a term newer than `after_term`
    ///
    /// When several nodes claim leadership (a stale leader cut off from the
    /// rest), the one with the highest term wins.
    pub async fn wait_for_leader_after(
        &self,
        after_term: u64,
        timeout: Duration,
    ) -> Option<Arc<RaftNode>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let leader = self
                .leaders()
                .into_iter()
                .filter(|n| n.term() > after_term)
                .max_by_key(|n| n.term());
            if leader.is_some() {
                return leader;
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<Arc<RaftNode>> {
        self.wait_for_leader_after(0, timeout).await
    }

    /// Stop `id` abruptly; its log storage survives for [`restart`](Self::restart)
    pub fn crash(&mut self, id: &str) {
        let Some(running) = self.members.get_mut(id).and_then(|m| m.running.take()) else {
            return;
        };
        running.node.shutdown();
        running.task.abort();
        self.network.unregister(id);
        tracing::info!("Crashed {}", id);
    }

    /// Boot a crashed node again from its surviving log storage
    pub fn restart(&mut self, id: &str) -> Result<()> {
        if self.running(id).is_some() {
            return Ok(());
        }
        self.boot(id)?;
        tracing::info!("Restarted {}", id);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        for id in self.ids.clone() {
            self.crash(&id);
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for running in self.members.values().filter_map(|m| m.running.as_ref()) {
            running.node.shutdown();
            running.task.abort();
        }
    }
}
