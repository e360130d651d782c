//! Configuration for minicoord components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "minicoord.toml";

/// Environment prefix, e.g. `MINICOORD__CONSENSUS__HEARTBEAT_INTERVAL_MS=20`
pub const ENV_PREFIX: &str = "MINICOORD";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the durable consensus logs (in-memory when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            consensus: ConsensusConfig::default(),
            detector: DetectorConfig::default(),
            store: StoreConfig::default(),
            replication: ReplicationConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load `minicoord.toml` (if present) overlaid with `MINICOORD__*` env vars
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from an explicit file path, still honoring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.log_level.trim().is_empty() {
            return Err(Error::InvalidConfig("log_level cannot be empty".into()));
        }
        self.consensus.validate()?;
        self.detector.validate()?;
        self.store.validate()
    }
}

/// Raft timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Lower bound of the randomized election timeout
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max_ms: u64,

    /// Leader heartbeat (empty AppendEntries) interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Per-RPC deadline
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// How long `propose` waits for a majority before giving up
    #[serde(default = "default_propose_timeout")]
    pub propose_timeout_ms: u64,

    /// Max entries carried by one AppendEntries
    #[serde(default = "default_max_append_entries")]
    pub max_append_entries: usize,
}

fn default_election_timeout_min() -> u64 {
    150
}
fn default_election_timeout_max() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    50
}
fn default_rpc_timeout() -> u64 {
    100
}
fn default_propose_timeout() -> u64 {
    2_000
}
fn default_max_append_entries() -> usize {
    64
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min(),
            election_timeout_max_ms: default_election_timeout_max(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            rpc_timeout_ms: default_rpc_timeout(),
            propose_timeout_ms: default_propose_timeout(),
            max_append_entries: default_max_append_entries(),
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(Error::InvalidConfig(
                "election_timeout_min_ms must be <= election_timeout_max_ms".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig("heartbeat_interval_ms must be > 0".into()));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms must be below election_timeout_min_ms".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(Error::InvalidConfig("max_append_entries must be > 0".into()));
        }
        Ok(())
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    /// Pick a fresh randomized election timeout
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(ms)
    }
}

/// Failure detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Threshold used by the fixed-timeout detector
    #[serde(default = "default_failure_timeout")]
    pub failure_timeout_ms: u64,

    /// Suspicion threshold for the accrual detector
    #[serde(default = "default_phi_threshold")]
    pub phi_threshold: f64,

    /// Inter-arrival samples kept per peer
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

fn default_failure_timeout() -> u64 {
    1_000
}
fn default_phi_threshold() -> f64 {
    8.0
}
fn default_window_size() -> usize {
    100
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            failure_timeout_ms: default_failure_timeout(),
            phi_threshold: default_phi_threshold(),
            window_size: default_window_size(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("window_size must be > 0".into()));
        }
        if self.phi_threshold.is_nan() || self.phi_threshold <= 0.0 {
            return Err(Error::InvalidConfig("phi_threshold must be > 0".into()));
        }
        Ok(())
    }

    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.failure_timeout_ms)
    }
}

/// Coordination store client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Namespace every client path is scoped under
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Session expires when not touched for this long
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,

    /// How often the session reaper runs
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_ms: u64,

    /// Backoff between attempts of the simple (non-fair) lock
    #[serde(default = "default_lock_retry_backoff")]
    pub lock_retry_backoff_ms: u64,
}

fn default_namespace() -> String {
    "minicoord".to_string()
}
fn default_session_timeout() -> u64 {
    10_000
}
fn default_reaper_interval() -> u64 {
    500
}
fn default_lock_retry_backoff() -> u64 {
    50
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            session_timeout_ms: default_session_timeout(),
            reaper_interval_ms: default_reaper_interval(),
            lock_retry_backoff_ms: default_lock_retry_backoff(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session_timeout_ms == 0 {
            return Err(Error::InvalidConfig("session_timeout_ms must be > 0".into()));
        }
        if self.reaper_interval_ms == 0 {
            return Err(Error::InvalidConfig("reaper_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn lock_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms)
    }
}

/// State replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Deadline for a single peer acknowledgement
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Deadline for one snapshot fetch during recovery
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_ms: u64,
}

fn default_ack_timeout() -> u64 {
    200
}
fn default_recovery_timeout() -> u64 {
    1_000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            recovery_timeout_ms: default_recovery_timeout(),
        }
    }
}

impl ReplicationConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}
