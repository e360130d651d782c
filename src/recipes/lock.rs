//! Exclusive distributed lock
//!
//! Two variants:
//! - [`LockKind::Fair`]: ephemeral sequential nodes under the lock path; the
//!   smallest sequence holds the lock and every waiter watches only its
//!   immediate predecessor (FIFO, no herd).
//! - [`LockKind::Simple`]: one ephemeral `lock` node; contenders retry after a
//!   deletion notification or a jittered backoff.
//!
//! Nodes are ephemeral, so a holder whose session dies releases the lock
//! without any action on its part.

use super::queue::{self, QueueEntry};
use crate::common::{Error, Result};
use crate::store::path;
use crate::store::{CoordinationStore, CreateMode};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const FAIR_PREFIX: &str = "lock-";
const SIMPLE_NODE: &str = "lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Simple,
    Fair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Unheld,
    Acquiring,
    Held,
    Released,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockState::Unheld => write!(f, "unheld"),
            LockState::Acquiring => write!(f, "acquiring"),
            LockState::Held => write!(f, "held"),
            LockState::Released => write!(f, "released"),
        }
    }
}

/// Proof of a granted lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHandle {
    pub lock_path: String,
    /// Node whose existence grants the lock
    pub node_path: String,
    pub acquired_at: DateTime<Utc>,
}

/// Payload written into lock nodes, for operators inspecting the store
pub(crate) fn owner_data(store: &dyn CoordinationStore) -> Vec<u8> {
    serde_json::json!({
        "session": store.session_id(),
        "created_at": Utc::now().to_rfc3339(),
    })
    .to_string()
    .into_bytes()
}

/// Exclusive lock on one path, owned by one caller
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    lock_path: String,
    kind: LockKind,
    retry_backoff: Duration,
    state: LockState,
    handle: Option<LockHandle>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("lock_path", &self.lock_path)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("handle", &self.handle)
            .finish()
    }
}

impl DistributedLock {
    /// Fair (sequential) lock
    pub fn new(store: Arc<dyn CoordinationStore>, lock_path: impl Into<String>) -> Self {
        Self::with_kind(store, lock_path, LockKind::Fair)
    }

    pub fn with_kind(
        store: Arc<dyn CoordinationStore>,
        lock_path: impl Into<String>,
        kind: LockKind,
    ) -> Self {
        Self {
            store,
            lock_path: lock_path.into(),
            kind,
            retry_backoff: Duration::from_millis(50),
            state: LockState::Unheld,
            handle: None,
        }
    }

    /// Base delay between attempts of the simple variant
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    /// Acquire the lock, waiting at most `timeout` (forever when `None`)
    ///
    /// Returns `Ok(false)` on timeout; no node is left behind in that case.
    pub async fn acquire(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.state == LockState::Held {
            return Ok(true);
        }
        path::validate(&self.lock_path)?;

        self.state = LockState::Acquiring;
        let deadline = timeout.map(|t| Instant::now() + t);

        let result = match self.store.ensure_path(&self.lock_path).await {
            Ok(()) => match self.kind {
                LockKind::Fair => self.acquire_fair(deadline).await,
                LockKind::Simple => self.acquire_simple(deadline).await,
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(Some(node_path)) => {
                tracing::debug!("Lock {} granted via {}", self.lock_path, node_path);
                self.handle = Some(LockHandle {
                    lock_path: self.lock_path.clone(),
                    node_path,
                    acquired_at: Utc::now(),
                });
                self.state = LockState::Held;
                Ok(true)
            }
            Ok(None) => {
                tracing::debug!("Lock {} acquire timed out", self.lock_path);
                self.state = LockState::Unheld;
                Ok(false)
            }
            Err(e) => {
                self.state = LockState::Unheld;
                Err(e)
            }
        }
    }

    async fn acquire_fair(&self, deadline: Option<Instant>) -> Result<Option<String>> {
        queue::enqueue_and_wait(
            self.store.as_ref(),
            &self.lock_path,
            FAIR_PREFIX,
            &[FAIR_PREFIX],
            owner_data(self.store.as_ref()),
            deadline,
            predecessor,
        )
        .await
    }

    async fn acquire_simple(&self, deadline: Option<Instant>) -> Result<Option<String>> {
        let node = path::join(&self.lock_path, SIMPLE_NODE);
        loop {
            match self
                .store
                .create(&node, CreateMode::Ephemeral, owner_data(self.store.as_ref()))
                .await
            {
                Ok(created) => return Ok(Some(created)),
                Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Ok(None);
            }

            let jitter = rand::thread_rng().gen_range(0..=self.retry_backoff.as_millis() as u64);
            let mut retry_at = now + self.retry_backoff + Duration::from_millis(jitter);
            if let Some(deadline) = deadline {
                retry_at = retry_at.min(deadline);
            }
            // contention: wait for the holder to go away or the backoff to pass
            queue::wait_for_change(self.store.as_ref(), &node, Some(retry_at)).await?;
        }
    }

    /// Release the lock
    ///
    /// Returns `Ok(false)` when nothing was held, including when the store
    /// already removed the node because the session ended.
    pub async fn release(&mut self) -> Result<bool> {
        if self.state != LockState::Held {
            return Ok(false);
        }
        let Some(handle) = self.handle.take() else {
            self.state = LockState::Released;
            return Ok(false);
        };
        self.state = LockState::Released;

        match self.store.delete(&handle.node_path, false).await {
            Ok(()) => {
                tracing::debug!("Lock {} released", self.lock_path);
                Ok(true)
            }
            Err(Error::NotFound(_)) | Err(Error::SessionLost(_)) => {
                tracing::debug!(
                    "Lock {} was already released by the store",
                    self.lock_path
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-check ownership against the store, refreshing the local view
    pub async fn is_held(&mut self) -> Result<bool> {
        if self.state != LockState::Held {
            return Ok(false);
        }
        let owned = match &self.handle {
            Some(handle) => match self.store.exists(&handle.node_path).await {
                Ok(Some(stat)) => stat.ephemeral_owner == Some(self.store.session_id()),
                Ok(None) | Err(Error::SessionLost(_)) => false,
                Err(e) => return Err(e),
            },
            None => false,
        };
        if !owned {
            tracing::info!("Lock {} lost (session ended)", self.lock_path);
            self.state = LockState::Released;
            self.handle = None;
        }
        Ok(owned)
    }
}

/// The node right before ours
fn predecessor(queue: &[QueueEntry], position: usize) -> Option<String> {
    position
        .checked_sub(1)
        .map(|prev| queue[prev].name.clone())
}
