//! Client sessions
//!
//! A session owns ephemeral nodes. When it closes or expires the store deletes
//! those nodes and publishes the new state on the session's watch channel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connected,
    /// Closed by its owner
    Closed,
    /// Timed out or forcibly terminated
    Expired,
}

impl SessionState {
    pub fn is_alive(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Expired => write!(f, "expired"),
        }
    }
}

pub(crate) struct SessionEntry {
    pub timeout: Duration,
    pub last_touch: Instant,
    pub ephemerals: BTreeSet<String>,
    pub state_tx: watch::Sender<SessionState>,
}

impl SessionEntry {
    pub fn new(timeout: Duration) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        (
            Self {
                timeout,
                last_touch: Instant::now(),
                ephemerals: BTreeSet::new(),
                state_tx,
            },
            state_rx,
        )
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_touch) > self.timeout
    }
}
