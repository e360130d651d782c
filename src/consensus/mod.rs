//! Leader election and log replication
//!
//! A simplified Raft: randomized elections, majority commit, leader no-op on
//! election, follower log repair. No snapshots and no membership changes.
//! [`RaftCore`] is the pure state machine of one node, [`RaftNode`] drives it
//! over a [`RaftTransport`] and persists through a [`LogStorage`].

pub mod log;
pub mod message;
pub mod node;
pub mod state;
pub mod storage;
pub mod transport;

pub use message::{
    AppendRequest, AppendResponse, EntryKind, Heartbeat, LogEntry, VoteRequest, VoteResponse,
};
pub use node::{start_raft_tasks, RaftNode};
pub use state::{RaftCore, RaftRole, RaftStatus};
pub use storage::{FileLogStorage, HardState, LogStorage, MemoryLogStorage, PersistedState};
pub use transport::RaftTransport;

use crate::common::utils::lock;
use std::sync::Mutex;

/// Receives committed commands in log order
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &LogEntry);
}

/// State machine that records every applied command
#[derive(Debug, Default)]
pub struct CommandLog {
    applied: Mutex<Vec<Vec<u8>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<Vec<u8>> {
        lock(&self.applied).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.applied).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.applied).is_empty()
    }
}

impl StateMachine for CommandLog {
    fn apply(&self, entry: &LogEntry) {
        lock(&self.applied).push(entry.data.clone());
    }
}
