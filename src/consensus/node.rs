//! Consensus node driver
//!
//! Wraps a [`RaftCore`] behind a single mutex and drives it: election and
//! heartbeat timers, per-peer RPC tasks, durable storage, commit notification
//! and application to the [`StateMachine`].

use super::message::{
    AppendRequest, AppendResponse, EntryKind, Heartbeat, LogEntry, VoteRequest, VoteResponse,
};
use super::state::{RaftCore, RaftRole, RaftStatus, StorageOp};
use super::storage::LogStorage;
use super::transport::RaftTransport;
use super::StateMachine;
use crate::common::utils::lock;
use crate::common::{timestamp_now_millis, ConsensusConfig, Error, NodeId, Result};
use crate::detector::FailureDetector;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

struct Inner {
    core: RaftCore,
    storage: Box<dyn LogStorage>,
    election_deadline: Instant,
    last_leader_contact: Instant,
    next_heartbeat: Instant,
}

pub struct RaftNode {
    id: NodeId,
    peers: Vec<NodeId>,
    config: ConsensusConfig,
    inner: Mutex<Inner>,
    transport: Arc<dyn RaftTransport>,
    state_machine: Option<Arc<dyn StateMachine>>,
    detector: Option<Arc<dyn FailureDetector>>,
    commit_tx: watch::Sender<u64>,
    /// Serializes application so entries reach the state machine in order
    apply_lock: Mutex<()>,
    /// Peers with an append-entries RPC outstanding
    inflight: Mutex<HashSet<NodeId>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("status", &self.status())
            .field("peers", &self.peers)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl RaftNode {
    /// Build a node from whatever `storage` already holds
    pub fn new(
        id: impl Into<NodeId>,
        peers: Vec<NodeId>,
        config: ConsensusConfig,
        mut storage: Box<dyn LogStorage>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let id = id.into();
        let persisted = storage.load()?;
        let peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != id).collect();
        let core = RaftCore::restore(id.clone(), peers.clone(), persisted)?;

        if core.term() > 0 || !core.log().is_empty() {
            tracing::info!(
                "Node {} restored term {} with {} log entries",
                id,
                core.term(),
                core.log().len()
            );
        }

        let now = Instant::now();
        let (commit_tx, _) = watch::channel(0);
        Ok(Self {
            inner: Mutex::new(Inner {
                core,
                storage,
                election_deadline: now + config.random_election_timeout(),
                last_leader_contact: now,
                next_heartbeat: now,
            }),
            id,
            peers,
            config,
            transport,
            state_machine: None,
            detector: None,
            commit_tx,
            apply_lock: Mutex::new(()),
            inflight: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn with_state_machine(mut self, state_machine: Arc<dyn StateMachine>) -> Self {
        self.state_machine = Some(state_machine);
        self
    }

    /// Let `detector` trigger elections when the known leader is suspected
    pub fn with_detector(mut self, detector: Arc<dyn FailureDetector>) -> Self {
        for peer in &self.peers {
            detector.watch_peer(peer);
        }
        self.detector = Some(detector);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn status(&self) -> RaftStatus {
        lock(&self.inner).core.status()
    }

    pub fn role(&self) -> RaftRole {
        lock(&self.inner).core.role()
    }

    pub fn is_leader(&self) -> bool {
        lock(&self.inner).core.is_leader()
    }

    pub fn term(&self) -> u64 {
        lock(&self.inner).core.term()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        lock(&self.inner).core.leader_id().map(str::to_string)
    }

    pub fn commit_index(&self) -> u64 {
        lock(&self.inner).core.commit_index()
    }

    /// Copy of the full log
    pub fn log_entries(&self) -> Vec<LogEntry> {
        lock(&self.inner).core.log().entries().to_vec()
    }

    /// Committed prefix of the log
    pub fn committed_entries(&self) -> Vec<LogEntry> {
        let inner = lock(&self.inner);
        inner.core.log().slice(1, inner.core.commit_index())
    }

    /// Channel carrying the commit index
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop ticking and refuse further RPCs, as if the process had crashed
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::info!("Node {} shutting down", self.id);
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::ConnectionFailed(format!("node {} is stopped", self.id)));
        }
        Ok(())
    }

    /// Flush queued storage writes; must run before replying
    ///
    /// Writes that fail stay queued and are retried first on the next call,
    /// so nothing acknowledged later rests on an entry storage never took.
    fn persist(inner: &mut Inner) -> Result<()> {
        let mut ops = inner.core.take_storage_ops().into_iter();
        while let Some(op) = ops.next() {
            let written = match &op {
                StorageOp::HardState { term, voted_for } => {
                    inner.storage.persist_term(*term, voted_for.as_deref())
                }
                StorageOp::Append(entries) => inner.storage.append_log(entries),
                StorageOp::Truncate(from) => inner.storage.truncate_log(*from),
            };
            if let Err(e) = written {
                let mut unwritten = vec![op];
                unwritten.extend(ops);
                inner.core.requeue_storage_ops(unwritten);
                return Err(e);
            }
        }
        Ok(())
    }

    fn reset_election_timer(&self, inner: &mut Inner) {
        inner.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    fn publish_commit(&self, inner: &Inner) {
        let commit = inner.core.commit_index();
        self.commit_tx.send_if_modified(|current| {
            if commit > *current {
                *current = commit;
                true
            } else {
                false
            }
        });
    }

    fn leader_suspected(&self, inner: &Inner, now: Instant) -> bool {
        let (Some(detector), Some(leader)) = (&self.detector, inner.core.leader_id()) else {
            return false;
        };
        leader != self.id
            && now.duration_since(inner.last_leader_contact) >= self.config.election_timeout_min()
            && detector.is_suspected(leader)
    }

    fn tick_interval(&self) -> Duration {
        (self.config.heartbeat_interval() / 2).max(Duration::from_millis(1))
    }

    /// One pass of the timer loop: elections, heartbeats and replication
    pub fn tick(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let now = Instant::now();
        let mut vote_request = None;
        let mut heartbeat_due = false;
        let leader;
        {
            let mut inner = lock(&self.inner);
            if !inner.core.is_leader() {
                let timed_out = now >= inner.election_deadline;
                let suspected = !timed_out && self.leader_suspected(&inner, now);
                if timed_out || suspected {
                    if suspected {
                        tracing::info!(
                            "Node {} suspects leader {:?}",
                            self.id,
                            inner.core.leader_id()
                        );
                    }
                    let request = inner.core.start_election();
                    if let Err(e) = Self::persist(&mut inner) {
                        tracing::error!("Node {} failed to persist vote: {}", self.id, e);
                        return;
                    }
                    self.reset_election_timer(&mut inner);
                    if inner.core.is_leader() {
                        inner.next_heartbeat = now;
                        self.publish_commit(&inner);
                    }
                    vote_request = Some(request);
                }
            }
            if now >= inner.next_heartbeat {
                inner.next_heartbeat = now + self.config.heartbeat_interval();
                heartbeat_due = true;
            }
            leader = inner.core.is_leader();
        }

        if let Some(request) = vote_request {
            self.request_votes(request);
        }
        if heartbeat_due {
            self.send_heartbeats();
            if leader {
                self.broadcast_append();
            }
        }
        if leader {
            self.apply_committed();
        }
    }

    fn request_votes(self: &Arc<Self>, request: VoteRequest) {
        for peer in &self.peers {
            let node = self.clone();
            let peer = peer.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let result = tokio::time::timeout(
                    node.config.rpc_timeout(),
                    node.transport.request_vote(&peer, request),
                )
                .await;
                match result {
                    Ok(Ok(resp)) => node.on_vote_response(&peer, resp),
                    Ok(Err(e)) => tracing::debug!("Vote request to {} failed: {}", peer, e),
                    Err(_) => tracing::debug!("Vote request to {} timed out", peer),
                }
            });
        }
    }

    fn on_vote_response(self: &Arc<Self>, peer: &str, resp: VoteResponse) {
        if self.is_stopped() {
            return;
        }
        let elected = {
            let mut inner = lock(&self.inner);
            let elected = inner.core.handle_vote_response(peer, &resp);
            if let Err(e) = Self::persist(&mut inner) {
                tracing::error!("Node {} failed to persist: {}", self.id, e);
                return;
            }
            if elected {
                inner.next_heartbeat = Instant::now() + self.config.heartbeat_interval();
            }
            elected
        };
        if elected {
            self.send_heartbeats();
            self.broadcast_append();
        }
    }

    fn send_heartbeats(self: &Arc<Self>) {
        let heartbeat = Heartbeat {
            peer_id: self.id.clone(),
            timestamp: timestamp_now_millis(),
        };
        for peer in &self.peers {
            let node = self.clone();
            let peer = peer.clone();
            let heartbeat = heartbeat.clone();
            tokio::spawn(async move {
                let _ = tokio::time::timeout(
                    node.config.rpc_timeout(),
                    node.transport.heartbeat(&peer, heartbeat),
                )
                .await;
            });
        }
    }

    fn broadcast_append(self: &Arc<Self>) {
        for peer in &self.peers {
            self.send_append(peer.clone());
        }
    }

    fn send_append(self: &Arc<Self>, peer: NodeId) {
        if !lock(&self.inflight).insert(peer.clone()) {
            return;
        }
        let request = lock(&self.inner)
            .core
            .append_request_for(&peer, self.config.max_append_entries);
        let Some(request) = request else {
            lock(&self.inflight).remove(&peer);
            return;
        };

        let node = self.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(
                node.config.rpc_timeout(),
                node.transport.append_entries(&peer, request),
            )
            .await;
            lock(&node.inflight).remove(&peer);
            match result {
                Ok(Ok(resp)) => node.on_append_response(&peer, resp),
                Ok(Err(e)) => tracing::debug!("Append to {} failed: {}", peer, e),
                Err(_) => tracing::debug!("Append to {} timed out", peer),
            }
        });
    }

    fn on_append_response(self: &Arc<Self>, peer: &str, resp: AppendResponse) {
        if self.is_stopped() {
            return;
        }
        let (advanced, lagging) = {
            let mut inner = lock(&self.inner);
            let advanced = inner.core.handle_append_response(peer, &resp);
            if let Err(e) = Self::persist(&mut inner) {
                tracing::error!("Node {} failed to persist: {}", self.id, e);
                return;
            }
            if advanced {
                self.publish_commit(&inner);
            }
            (advanced, inner.core.peer_lagging(peer))
        };
        if advanced {
            self.apply_committed();
        }
        if lagging {
            self.send_append(peer.to_string());
        }
    }

    /// Hand newly committed commands to the state machine, in index order
    pub fn apply_committed(&self) {
        let _guard = lock(&self.apply_lock);
        let entries = lock(&self.inner).core.take_committed();
        let Some(state_machine) = &self.state_machine else {
            return;
        };
        for entry in entries.iter().filter(|e| e.kind == EntryKind::Command) {
            state_machine.apply(entry);
        }
    }

    /// Handle an incoming vote request
    pub fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.ensure_running()?;
        let mut inner = lock(&self.inner);
        let resp = inner.core.handle_vote_request(&req);
        Self::persist(&mut inner)?;
        if resp.vote_granted {
            self.reset_election_timer(&mut inner);
        }
        Ok(resp)
    }

    /// Handle an incoming append-entries
    pub fn append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        self.ensure_running()?;
        let term = req.term;

        let (resp, commit_moved) = {
            let mut inner = lock(&self.inner);
            let before = inner.core.commit_index();
            let resp = inner.core.handle_append_entries(req);
            Self::persist(&mut inner)?;
            let resp = resp?;

            if resp.term == term {
                let now = Instant::now();
                inner.last_leader_contact = now;
                self.reset_election_timer(&mut inner);
            }
            let moved = inner.core.commit_index() > before;
            if moved {
                self.publish_commit(&inner);
            }
            (resp, moved)
        };

        if commit_moved {
            self.apply_committed();
        }
        Ok(resp)
    }

    /// Handle an incoming liveness ping; the only input to the detector
    pub fn receive_heartbeat(&self, heartbeat: Heartbeat) {
        if self.is_stopped() {
            return;
        }
        if let Some(detector) = &self.detector {
            detector.heartbeat(&heartbeat.peer_id);
        }
    }

    /// Replicate a command through the cluster
    ///
    /// `Ok(true)` once committed, `Ok(false)` if another leader's entry took
    /// its index, `NotLeader` on a non-leader and `QuorumUnavailable` when no
    /// majority acknowledged it within the propose timeout.
    pub async fn propose(self: &Arc<Self>, data: Vec<u8>) -> Result<bool> {
        self.ensure_running()?;
        let mut commits = self.commit_tx.subscribe();

        let (term, index) = {
            let mut inner = lock(&self.inner);
            let position = inner.core.propose(data)?;
            Self::persist(&mut inner)?;
            self.publish_commit(&inner);
            position
        };
        tracing::debug!("Node {} proposed entry {} in term {}", self.id, index, term);
        self.broadcast_append();

        let committed = tokio::time::timeout(self.config.propose_timeout(), async {
            commits.wait_for(|&commit| commit >= index).await.map(|_| ())
        })
        .await;

        match committed {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(Error::Internal("commit channel closed".into())),
            Err(_) => {
                let inner = lock(&self.inner);
                if inner.core.log().term_at(index) != Some(term) {
                    return Ok(false);
                }
                let acks = if inner.core.is_leader() && inner.core.term() == term {
                    inner.core.replicated_count(index)
                } else {
                    1
                };
                tracing::warn!(
                    "Node {}: entry {} not committed ({}/{} acks)",
                    self.id,
                    index,
                    acks,
                    inner.core.quorum()
                );
                return Err(Error::QuorumUnavailable {
                    acks,
                    required: inner.core.quorum(),
                });
            }
        }

        self.apply_committed();
        let kept = lock(&self.inner).core.log().term_at(index) == Some(term);
        if !kept {
            tracing::info!("Node {}: entry {} superseded by another leader", self.id, index);
        }
        Ok(kept)
    }
}

/// Spawn the timer loop; it ends when the node is stopped or dropped
pub fn start_raft_tasks(node: &Arc<RaftNode>) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(node);
    let interval = node.tick_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(node) = weak.upgrade() else {
                break;
            };
            if node.is_stopped() {
                break;
            }
            node.tick();
        }
    })
}
