//! Distributed read/write lock
//!
//! Readers and writers share one sequential queue under the lock root
//! (`read-NNNNNNNNNN`, `write-NNNNNNNNNN`), so the store assigns a single total
//! order to both kinds. A read is granted once no write precedes it; a write is
//! granted once nothing precedes it. Checking `/read` and `/write` separately
//! and then creating would leave a window where a reader and a writer both see
//! the other side empty; the shared queue closes it.

use super::lock::{owner_data, LockHandle, LockState};
use super::queue::{self, QueueEntry};
use crate::common::{Error, Result};
use crate::store::path;
use crate::store::CoordinationStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const READ_PREFIX: &str = "read-";
const WRITE_PREFIX: &str = "write-";
const QUEUE_PREFIXES: [&str; 2] = [READ_PREFIX, WRITE_PREFIX];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RwMode {
    Read,
    Write,
}

impl RwMode {
    fn prefix(&self) -> &'static str {
        match self {
            RwMode::Read => READ_PREFIX,
            RwMode::Write => WRITE_PREFIX,
        }
    }
}

/// Shared/exclusive lock on one root, owned by one caller
pub struct DistributedReadWriteLock {
    store: Arc<dyn CoordinationStore>,
    root: String,
    state: LockState,
    mode: Option<RwMode>,
    handle: Option<LockHandle>,
}

impl std::fmt::Debug for DistributedReadWriteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedReadWriteLock")
            .field("root", &self.root)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("handle", &self.handle)
            .finish()
    }
}

impl DistributedReadWriteLock {
    pub fn new(store: Arc<dyn CoordinationStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
            state: LockState::Unheld,
            mode: None,
            handle: None,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn mode(&self) -> Option<RwMode> {
        self.mode
    }

    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    pub async fn acquire_read(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.acquire(RwMode::Read, timeout).await
    }

    pub async fn acquire_write(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.acquire(RwMode::Write, timeout).await
    }

    async fn acquire(&mut self, mode: RwMode, timeout: Option<Duration>) -> Result<bool> {
        if self.state == LockState::Held {
            return match self.mode {
                Some(held) if held == mode => Ok(true),
                _ => Err(Error::Other(format!(
                    "{} already held in {:?} mode",
                    self.root, self.mode
                ))),
            };
        }
        path::validate(&self.root)?;

        self.state = LockState::Acquiring;
        let deadline = timeout.map(|t| Instant::now() + t);

        let blocker = match mode {
            RwMode::Read => preceding_writer,
            RwMode::Write => preceding_any,
        };
        let result = match self.store.ensure_path(&self.root).await {
            Ok(()) => {
                queue::enqueue_and_wait(
                    self.store.as_ref(),
                    &self.root,
                    mode.prefix(),
                    &QUEUE_PREFIXES,
                    owner_data(self.store.as_ref()),
                    deadline,
                    blocker,
                )
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(Some(node_path)) => {
                tracing::debug!("{:?} lock on {} granted via {}", mode, self.root, node_path);
                self.handle = Some(LockHandle {
                    lock_path: self.root.clone(),
                    node_path,
                    acquired_at: Utc::now(),
                });
                self.mode = Some(mode);
                self.state = LockState::Held;
                Ok(true)
            }
            Ok(None) => {
                self.state = LockState::Unheld;
                Ok(false)
            }
            Err(e) => {
                self.state = LockState::Unheld;
                Err(e)
            }
        }
    }

    /// Release whichever side is held; `Ok(false)` when nothing was held
    pub async fn release(&mut self) -> Result<bool> {
        if self.state != LockState::Held {
            return Ok(false);
        }
        self.state = LockState::Released;
        self.mode = None;
        let Some(handle) = self.handle.take() else {
            return Ok(false);
        };

        match self.store.delete(&handle.node_path, false).await {
            Ok(()) => Ok(true),
            Err(Error::NotFound(_)) | Err(Error::SessionLost(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Last write node queued before us
fn preceding_writer(queue: &[QueueEntry], position: usize) -> Option<String> {
    queue[..position]
        .iter()
        .rev()
        .find(|e| e.has_prefix(WRITE_PREFIX))
        .map(|e| e.name.clone())
}

/// Immediate predecessor of either kind
fn preceding_any(queue: &[QueueEntry], position: usize) -> Option<String> {
    position
        .checked_sub(1)
        .map(|prev| queue[prev].name.clone())
}
