//! Pure consensus state
//!
//! [`RaftCore`] holds one node's term, vote, log and replication progress.
//! Every transition is a synchronous method taking an event and returning the
//! response to send; nothing here touches timers, tasks or the network. Changes
//! that must reach durable storage before a response leaves the node are
//! queued as [`StorageOp`]s for the driver to flush.

use super::log::{AppendOutcome, LogEntryBody, RaftLog};
use super::message::{AppendRequest, AppendResponse, LogEntry, VoteRequest, VoteResponse};
use super::storage::PersistedState;
use crate::common::{quorum, Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Pending write to durable storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    HardState {
        term: u64,
        voted_for: Option<NodeId>,
    },
    Append(Vec<LogEntry>),
    Truncate(u64),
}

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug)]
pub struct RaftCore {
    id: NodeId,
    peers: Vec<NodeId>,
    role: RaftRole,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    votes: HashSet<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    storage_ops: Vec<StorageOp>,
}

impl RaftCore {
    pub fn new(id: impl Into<NodeId>, peers: Vec<NodeId>) -> Self {
        let id = id.into();
        let peers = peers.into_iter().filter(|p| *p != id).collect();
        Self {
            id,
            peers,
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            storage_ops: Vec::new(),
        }
    }

    /// Rebuild from durable state after a restart
    pub fn restore(id: impl Into<NodeId>, peers: Vec<NodeId>, state: PersistedState) -> Result<Self> {
        let mut core = Self::new(id, peers);
        core.current_term = state.hard_state.term;
        core.voted_for = state.hard_state.voted_for;
        core.log = RaftLog::from_entries(state.entries)?;
        Ok(core)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn quorum(&self) -> usize {
        quorum(self.cluster_size())
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id.clone(),
            role: self.role,
            term: self.current_term,
            leader_id: self.leader_id.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    /// Storage writes accumulated since the last call
    pub fn take_storage_ops(&mut self) -> Vec<StorageOp> {
        std::mem::take(&mut self.storage_ops)
    }

    /// Put writes that did not reach storage back in front of the queue
    pub fn requeue_storage_ops(&mut self, mut unwritten: Vec<StorageOp>) {
        unwritten.append(&mut self.storage_ops);
        self.storage_ops = unwritten;
    }

    fn persist_hard_state(&mut self) {
        self.storage_ops.push(StorageOp::HardState {
            term: self.current_term,
            voted_for: self.voted_for.clone(),
        });
    }

    /// Requests from an older term are refused outright
    fn check_term(&self, term: u64) -> Result<()> {
        if term < self.current_term {
            return Err(Error::StaleTerm {
                received: term,
                current: self.current_term,
            });
        }
        Ok(())
    }

    /// Move to a newer term as follower; no-op for older or equal terms
    fn adopt_term(&mut self, term: u64) -> bool {
        if term <= self.current_term {
            return false;
        }
        if self.role != RaftRole::Follower {
            tracing::info!(
                "Node {} stepping down from {} (term {} -> {})",
                self.id,
                self.role,
                self.current_term,
                term
            );
        }
        self.current_term = term;
        self.voted_for = None;
        self.role = RaftRole::Follower;
        self.leader_id = None;
        self.votes.clear();
        self.persist_hard_state();
        true
    }

    /// Revert to follower, adopting `term` if newer
    pub fn step_down(&mut self, term: u64, leader_id: Option<NodeId>) {
        self.adopt_term(term);
        self.role = RaftRole::Follower;
        self.votes.clear();
        if leader_id.is_some() {
            self.leader_id = leader_id;
        }
    }

    /// Become candidate for the next term and build the vote request
    pub fn start_election(&mut self) -> VoteRequest {
        self.current_term += 1;
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.id.clone());
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.persist_hard_state();

        tracing::info!(
            "Node {} starting election for term {}",
            self.id,
            self.current_term
        );

        let request = VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        if self.votes.len() >= self.quorum() {
            self.become_leader();
        }
        request
    }

    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> VoteResponse {
        if let Err(e) = self.check_term(req.term) {
            tracing::debug!(
                "Node {} rejecting vote request from {}: {}",
                self.id,
                req.candidate_id,
                e
            );
            return VoteResponse {
                term: self.current_term,
                vote_granted: false,
            };
        }
        self.adopt_term(req.term);

        let free = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == req.candidate_id,
        };
        let granted = free && self.log.is_up_to_date(req.last_log_term, req.last_log_index);
        if granted && self.voted_for.is_none() {
            self.voted_for = Some(req.candidate_id.clone());
            self.persist_hard_state();
        }

        tracing::debug!(
            "Node {} vote for {} in term {}: {}",
            self.id,
            req.candidate_id,
            self.current_term,
            granted
        );
        VoteResponse {
            term: self.current_term,
            vote_granted: granted,
        }
    }

    /// Count a vote; returns true if it made this node leader
    pub fn handle_vote_response(&mut self, from: &str, resp: &VoteResponse) -> bool {
        if self.adopt_term(resp.term) {
            return false;
        }
        if self.role != RaftRole::Candidate || resp.term != self.current_term || !resp.vote_granted
        {
            return false;
        }
        self.votes.insert(from.to_string());
        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    fn become_leader(&mut self) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id.clone());
        self.votes.clear();

        let next = self.log.last_index() + 1;
        self.next_index = self.peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = self.peers.iter().map(|p| (p.clone(), 0)).collect();

        let noop = self.log.append(self.current_term, LogEntryBody::Noop);
        self.storage_ops.push(StorageOp::Append(vec![noop]));

        tracing::info!(
            "Node {} became leader for term {}",
            self.id,
            self.current_term
        );
        self.advance_commit();
    }

    /// Next append-entries for `peer`, empty when it is caught up
    pub fn append_request_for(&self, peer: &str, max_entries: usize) -> Option<AppendRequest> {
        if self.role != RaftRole::Leader {
            return None;
        }
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .max(1);
        let prev_log_index = next - 1;
        Some(AppendRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next, max_entries),
            leader_commit: self.commit_index,
        })
    }

    /// Whether `peer` still lacks entries the leader holds
    pub fn peer_lagging(&self, peer: &str) -> bool {
        self.role == RaftRole::Leader
            && self
                .next_index
                .get(peer)
                .is_some_and(|&next| next <= self.log.last_index())
    }

    pub fn handle_append_entries(&mut self, req: AppendRequest) -> Result<AppendResponse> {
        let reject = |term: u64, conflict_index: u64| AppendResponse {
            term,
            success: false,
            match_index: 0,
            conflict_index,
        };

        if let Err(e) = self.check_term(req.term) {
            tracing::debug!(
                "Node {} rejecting append from {}: {}",
                self.id,
                req.leader_id,
                e
            );
            return Ok(reject(self.current_term, 0));
        }
        self.adopt_term(req.term);

        if self.role == RaftRole::Leader {
            tracing::error!(
                "Node {} received append from {} while leading term {}",
                self.id,
                req.leader_id,
                self.current_term
            );
            return Ok(reject(self.current_term, 0));
        }
        self.role = RaftRole::Follower;
        self.votes.clear();
        if self.leader_id.as_deref() != Some(req.leader_id.as_str()) {
            tracing::info!(
                "Node {} following {} in term {}",
                self.id,
                req.leader_id,
                self.current_term
            );
            self.leader_id = Some(req.leader_id.clone());
        }

        let outcome = self.log.try_append(
            req.prev_log_index,
            req.prev_log_term,
            req.entries,
            self.commit_index,
        )?;

        match outcome {
            AppendOutcome::Mismatch { conflict_index } => {
                tracing::debug!(
                    "Node {} log mismatch at {} (hint {})",
                    self.id,
                    req.prev_log_index,
                    conflict_index
                );
                Ok(reject(self.current_term, conflict_index))
            }
            AppendOutcome::Appended {
                match_index,
                truncated_from,
                appended,
            } => {
                if let Some(from) = truncated_from {
                    tracing::info!("Node {} truncating uncommitted log from {}", self.id, from);
                    self.storage_ops.push(StorageOp::Truncate(from));
                }
                if !appended.is_empty() {
                    self.storage_ops.push(StorageOp::Append(appended));
                }
                let new_commit = req.leader_commit.min(match_index);
                if new_commit > self.commit_index {
                    self.commit_index = new_commit;
                }
                Ok(AppendResponse {
                    term: self.current_term,
                    success: true,
                    match_index,
                    conflict_index: 0,
                })
            }
        }
    }

    /// Update replication progress; returns true if the commit index moved
    pub fn handle_append_response(&mut self, from: &str, resp: &AppendResponse) -> bool {
        if self.adopt_term(resp.term) {
            return false;
        }
        if self.role != RaftRole::Leader || resp.term != self.current_term {
            return false;
        }

        let matched = self.match_index.entry(from.to_string()).or_insert(0);
        if resp.success {
            *matched = (*matched).max(resp.match_index);
            let matched = *matched;
            self.next_index.insert(from.to_string(), matched + 1);
            return self.advance_commit();
        }

        let floor = *matched + 1;
        let next = self.next_index.entry(from.to_string()).or_insert(floor);
        let hinted = if resp.conflict_index > 0 && resp.conflict_index < *next {
            resp.conflict_index
        } else {
            next.saturating_sub(1)
        };
        *next = hinted.max(floor).max(1);
        false
    }

    /// Commit the highest current-term index held by a majority
    pub fn advance_commit(&mut self) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }
        let quorum = self.quorum();
        let mut index = self.log.last_index();
        while index > self.commit_index {
            match self.log.term_at(index) {
                Some(term) if term == self.current_term => {}
                // earlier terms only commit through a current-term entry
                _ => break,
            }
            if self.replicated_count(index) >= quorum {
                tracing::debug!("Node {} committed up to {}", self.id, index);
                self.commit_index = index;
                return true;
            }
            index -= 1;
        }
        false
    }

    /// Members (self included) known to hold `index`
    pub fn replicated_count(&self, index: u64) -> usize {
        let own = usize::from(self.log.last_index() >= index);
        own + self.match_index.values().filter(|&&m| m >= index).count()
    }

    /// Append a client command; returns its (term, index)
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(u64, u64)> {
        if self.role != RaftRole::Leader {
            return Err(Error::NotLeader(
                self.leader_id.clone().unwrap_or_else(|| "unknown".to_string()),
            ));
        }
        let entry = self.log.append(self.current_term, LogEntryBody::Command(data));
        let position = (entry.term, entry.index);
        self.storage_ops.push(StorageOp::Append(vec![entry]));
        self.advance_commit();
        Ok(position)
    }

    /// Committed entries not yet handed to the state machine, in index order
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let entries = self.log.slice(self.last_applied + 1, self.commit_index);
        self.last_applied = self.commit_index;
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(n: usize) -> Vec<RaftCore> {
        let ids: Vec<NodeId> = (1..=n).map(|i| format!("n{}", i)).collect();
        ids.iter()
            .map(|id| RaftCore::new(id.clone(), ids.clone()))
            .collect()
    }

    /// Elect `nodes[0]` by delivering its vote requests to everyone
    fn elect_first(nodes: &mut [RaftCore]) {
        let req = nodes[0].start_election();
        for i in 1..nodes.len() {
            let resp = nodes[i].handle_vote_request(&req);
            let from = nodes[i].id().to_string();
            nodes[0].handle_vote_response(&from, &resp);
        }
        assert!(nodes[0].is_leader());
    }

    /// One round of append-entries from `nodes[0]` to every follower
    fn replicate(nodes: &mut [RaftCore]) {
        for i in 1..nodes.len() {
            let peer = nodes[i].id().to_string();
            let Some(req) = nodes[0].append_request_for(&peer, 64) else {
                return;
            };
            let resp = nodes[i].handle_append_entries(req).unwrap();
            nodes[0].handle_append_response(&peer, &resp);
        }
    }

    #[test]
    fn test_single_node_elects_itself() {
        let mut node = RaftCore::new("solo", vec![]);
        node.start_election();
        assert!(node.is_leader());
        let (_, index) = node.propose(b"x".to_vec()).unwrap();
        assert_eq!(node.commit_index(), index);
        assert_eq!(node.take_committed().len(), 2);
    }

    #[test]
    fn test_election_and_noop() {
        let mut nodes = cluster(3);
        elect_first(&mut nodes);
        assert_eq!(nodes[0].term(), 1);
        assert_eq!(nodes[0].log().last_index(), 1);
        assert_eq!(nodes[1].voted_for(), Some("n1"));

        replicate(&mut nodes);
        assert_eq!(nodes[0].commit_index(), 1);
        replicate(&mut nodes);
        assert_eq!(nodes[1].commit_index(), 1);
        assert_eq!(nodes[2].leader_id(), Some("n1"));
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut nodes = cluster(3);
        let req_a = nodes[0].start_election();
        let req_b = nodes[1].start_election();
        assert_eq!(req_a.term, req_b.term);

        assert!(nodes[2].handle_vote_request(&req_a).vote_granted);
        assert!(!nodes[2].handle_vote_request(&req_b).vote_granted);
        // repeated request from the same candidate is idempotent
        assert!(nodes[2].handle_vote_request(&req_a).vote_granted);
    }

    #[test]
    fn test_vote_refused_for_stale_log() {
        let mut nodes = cluster(3);
        elect_first(&mut nodes);
        nodes[0].propose(b"a".to_vec()).unwrap();
        replicate(&mut nodes);

        // n3 never saw anything: fresh log, cannot win n2's vote
        let mut lagging = RaftCore::new("n3", vec!["n1".into(), "n2".into()]);
        let req = lagging.start_election();
        let req = VoteRequest { term: req.term + 5, ..req };
        let resp = nodes[1].handle_vote_request(&req);
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, req.term);
    }

    #[test]
    fn test_stale_term_rejected() {
        let mut nodes = cluster(3);
        elect_first(&mut nodes);
        let stale = AppendRequest {
            term: 0,
            leader_id: "n9".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let resp = nodes[1].handle_append_entries(stale).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.term, 1);
        assert_eq!(nodes[1].role(), RaftRole::Follower);
    }

    #[test]
    fn test_commit_requires_majority() {
        let mut nodes = cluster(5);
        elect_first(&mut nodes);
        let (_, index) = nodes[0].propose(b"cmd".to_vec()).unwrap();

        // only n2 answers
        let req = nodes[0].append_request_for("n2", 64).unwrap();
        let resp = nodes[1].handle_append_entries(req).unwrap();
        assert!(!nodes[0].handle_append_response("n2", &resp));
        assert_eq!(nodes[0].replicated_count(index), 2);

        let req = nodes[0].append_request_for("n3", 64).unwrap();
        let resp = nodes[2].handle_append_entries(req).unwrap();
        assert!(nodes[0].handle_append_response("n3", &resp));
        assert_eq!(nodes[0].commit_index(), index);
    }

    #[test]
    fn test_divergent_follower_repaired() {
        let mut nodes = cluster(3);
        elect_first(&mut nodes);
        replicate(&mut nodes);

        // n1 appends entries nobody else sees, then loses leadership
        nodes[0].propose(b"lost-1".to_vec()).unwrap();
        nodes[0].propose(b"lost-2".to_vec()).unwrap();

        let req = nodes[1].start_election();
        let resp = nodes[2].handle_vote_request(&req);
        assert!(nodes[1].handle_vote_response("n3", &resp));
        nodes[1].propose(b"kept".to_vec()).unwrap();

        let mut leader_first: Vec<RaftCore> = Vec::new();
        let mut rest = std::mem::take(&mut nodes);
        leader_first.push(rest.remove(1));
        leader_first.extend(rest);

        for _ in 0..5 {
            replicate(&mut leader_first);
        }
        let leader_log: Vec<_> = leader_first[0].log().entries().to_vec();
        for node in &leader_first[1..] {
            assert_eq!(node.log().entries(), &leader_log[..]);
        }
        assert_eq!(leader_first[1].role(), RaftRole::Follower);
        assert!(leader_first[1]
            .take_storage_ops()
            .iter()
            .any(|op| matches!(op, StorageOp::Truncate(2))));
    }

    #[test]
    fn test_propose_on_follower() {
        let mut nodes = cluster(3);
        elect_first(&mut nodes);
        replicate(&mut nodes);
        match nodes[1].propose(vec![]) {
            Err(Error::NotLeader(leader)) => assert_eq!(leader, "n1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_restore() {
        let mut nodes = cluster(3);
        elect_first(&mut nodes);
        let ops = nodes[0].take_storage_ops();
        assert!(ops.contains(&StorageOp::HardState {
            term: 1,
            voted_for: Some("n1".into())
        }));

        let state = PersistedState {
            hard_state: super::super::storage::HardState {
                term: 4,
                voted_for: Some("n2".into()),
            },
            entries: vec![LogEntry::noop(4, 1)],
        };
        let core = RaftCore::restore("n1", vec!["n2".into()], state).unwrap();
        assert_eq!(core.term(), 4);
        assert_eq!(core.voted_for(), Some("n2"));
        assert_eq!(core.log().last_index(), 1);
        assert_eq!(core.commit_index(), 0);
    }
}
