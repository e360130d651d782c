//! # minicoord
//!
//! Distributed coordination building blocks:
//! - A hierarchical coordination store client with sessions, ephemeral and
//!   sequential nodes, and watches
//! - Distributed locks (exclusive and read/write) and a service registry
//! - Raft-style leader election and log replication
//! - Fixed-timeout and phi-accrual failure detectors
//! - Versioned state replication with recovery from peers
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Consensus node               │
//! │  RaftCore (pure state) ── RaftNode (timers)  │
//! │        │                       │             │
//! │   LogStorage            FailureDetector      │
//! └────────┬───────────────────────┬─────────────┘
//!          │ RaftTransport         │ heartbeats
//!   ┌──────┴───────────────────────┴──────┐
//!   │      LocalNetwork (in-process)      │
//!   └──────┬──────────────────────────────┘
//!          │ StateTransport
//! ┌────────▼─────────┐      ┌──────────────────────┐
//! │ StateReplicator  │      │ CoordinationStore    │
//! │ RecoveryManager  │      │  └ locks, registry   │
//! └──────────────────┘      └──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run a simulated cluster
//! ```bash
//! minicoord-sim --nodes 5 --commands 20 --isolate-leader
//! ```
//!
//! ### Take a lock
//! ```no_run
//! # async fn demo() -> minicoord::Result<()> {
//! use minicoord::recipes::DistributedLock;
//! use minicoord::store::MemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let store = MemoryStore::new();
//! let client = Arc::new(store.connect("app", Duration::from_secs(10))?);
//! let mut lock = DistributedLock::new(client, "/locks/leader");
//! if lock.acquire(Some(Duration::from_secs(1))).await? {
//!     // critical section
//!     lock.release().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod consensus;
pub mod detector;
pub mod network;
pub mod recipes;
pub mod replication;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use consensus::RaftNode;
pub use detector::FailureDetector;
pub use network::{LocalCluster, LocalNetwork};
pub use replication::{RecoveryManager, StateReplicator};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
