//! Coordination store client
//!
//! A hierarchical namespace of persistent, ephemeral and sequential nodes with
//! one-shot and persistent watches. [`CoordinationStore`] is the boundary the
//! lock and registry recipes consume; [`MemoryStore`] is an in-process
//! implementation of the service and [`StoreClient`] binds one session and
//! namespace to it.

pub mod client;
pub mod memory;
pub mod path;
pub mod session;
pub mod watch;

pub use client::StoreClient;
pub use memory::MemoryStore;
pub use session::{SessionId, SessionState};
pub use watch::{
    callback, notify_callback, WatchCallback, WatchEvent, WatchEventKind, WatchId, WatchMode,
};

use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Node lifetime and naming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    /// Deleted when the owning session ends
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Data version, bumped on every `set_data`
    pub version: u64,
    /// Child list version
    pub cversion: u64,
    pub ephemeral_owner: Option<SessionId>,
    pub created_zxid: u64,
    pub modified_zxid: u64,
    pub num_children: usize,
}

/// Client view of a coordination service, bound to one session
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    fn session_id(&self) -> SessionId;

    fn session_state(&self) -> SessionState;

    /// Channel publishing session state changes
    fn session_events(&self) -> tokio::sync::watch::Receiver<SessionState>;

    /// Create the path and any missing ancestors as persistent nodes
    async fn ensure_path(&self, path: &str) -> Result<()>;

    /// Create a node, returning its actual path (with suffix if sequential)
    async fn create(&self, path: &str, mode: CreateMode, data: Vec<u8>) -> Result<String>;

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)>;

    async fn exists(&self, path: &str) -> Result<Option<Stat>>;

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<Stat>;

    /// Child names, sorted
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    async fn watch(&self, path: &str, mode: WatchMode, callback: WatchCallback)
        -> Result<WatchId>;

    async fn unwatch(&self, id: WatchId) -> Result<bool>;

    /// End the session, removing its ephemeral nodes
    async fn close(&self) -> Result<()>;
}
