//! In-process cluster networking
//!
//! Routes consensus and replication RPCs between nodes living in the same
//! process, with controllable link failures for tests and the simulator.

pub mod cluster;
pub mod local;

pub use cluster::LocalCluster;
pub use local::{LocalNetwork, LocalTransport};
