//! Common utilities and types shared across minicoord

pub mod clock;
pub mod config;
pub mod error;
pub mod utils;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::{Config, ConsensusConfig, DetectorConfig, ReplicationConfig, StoreConfig};
pub use error::{Error, Result};
pub use utils::{
    crc32, parse_duration, quorum, retry_with_backoff, timestamp_now_millis, NodeId,
    NodeState,
};
