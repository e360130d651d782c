//! Phi-accrual failure detector
//!
//! Models heartbeat inter-arrival times as a logistic distribution fitted to
//! the sample mean and standard deviation of a sliding window. The suspicion
//! level for a silence of `dt` milliseconds is
//!
//! ```text
//! phi(dt) = -log10(1 - F(dt)),  F(dt) = 1 / (1 + e^(-(dt - mean) / stddev))
//!         = log10(1 + e^((dt - mean) / stddev))
//! ```
//!
//! so phi grows with the silence and adapts to each peer's jitter. A phi of 8
//! means roughly a 1e-8 chance that a heartbeat is merely late.

use super::heartbeat::HeartbeatTracker;
use super::FailureDetector;
use crate::common::utils::lock;
use crate::common::{Clock, DetectorConfig, NodeId};
use std::collections::HashSet;
use std::f64::consts::LN_10;
use std::sync::{Arc, Mutex};

pub const DEFAULT_THRESHOLD: f64 = 8.0;

/// Suspicion level for a silence of `elapsed` ms given the window statistics
///
/// With zero deviation the distribution degenerates to a step at `mean`.
pub fn phi(elapsed: f64, mean: f64, std_dev: f64) -> f64 {
    if std_dev.is_nan() || std_dev <= 0.0 {
        return if elapsed > mean { f64::INFINITY } else { 0.0 };
    }
    let y = (elapsed - mean) / std_dev;
    // ln(1 + e^y) without overflowing for large y
    let ln = if y > 0.0 {
        y + (-y).exp().ln_1p()
    } else {
        y.exp().ln_1p()
    };
    ln / LN_10
}

#[derive(Debug)]
pub struct AccrualFailureDetector {
    clock: Arc<dyn Clock>,
    threshold: f64,
    tracker: Mutex<HeartbeatTracker>,
}

impl AccrualFailureDetector {
    pub fn new(threshold: f64, window_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            threshold,
            tracker: Mutex::new(HeartbeatTracker::new(window_size)),
        }
    }

    pub fn from_config(config: &DetectorConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.phi_threshold, config.window_size, clock)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Current suspicion of `peer`; `+inf` until two heartbeats have arrived
    pub fn phi(&self, peer: &str) -> f64 {
        let now = self.clock.now_millis();
        let tracker = lock(&self.tracker);
        let Some(record) = tracker.get(peer) else {
            return f64::INFINITY;
        };
        match (record.elapsed(now), record.mean(), record.std_dev()) {
            (Some(elapsed), Some(mean), Some(std_dev)) => phi(elapsed as f64, mean, std_dev),
            _ => f64::INFINITY,
        }
    }
}

impl FailureDetector for AccrualFailureDetector {
    fn heartbeat(&self, peer: &str) {
        let now = self.clock.now_millis();
        lock(&self.tracker).record(peer, now);
    }

    fn watch_peer(&self, peer: &str) {
        lock(&self.tracker).watch_peer(peer);
    }

    fn last_seen(&self, peer: &str) -> Option<u64> {
        lock(&self.tracker).get(peer).and_then(|r| r.last_seen)
    }

    fn is_suspected(&self, peer: &str) -> bool {
        self.phi(peer) > self.threshold
    }

    fn check_all(&self) -> HashSet<NodeId> {
        let peers: Vec<NodeId> = lock(&self.tracker)
            .records()
            .filter(|r| r.last_seen.is_some())
            .map(|r| r.peer_id.clone())
            .collect();
        peers
            .into_iter()
            .filter(|peer| self.is_suspected(peer))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;
    use std::time::Duration;

    fn beat_every(fd: &AccrualFailureDetector, clock: &ManualClock, peer: &str, gaps: &[u64]) {
        fd.heartbeat(peer);
        for gap in gaps {
            clock.advance(Duration::from_millis(*gap));
            fd.heartbeat(peer);
        }
    }

    #[test]
    fn test_phi_function() {
        // at the mean the logistic CDF is 1/2
        assert!((phi(100.0, 100.0, 10.0) - 2f64.log10()).abs() < 1e-12);
        assert!(phi(50.0, 100.0, 10.0) < phi(100.0, 100.0, 10.0));
        assert!(phi(10_000.0, 100.0, 10.0).is_finite());
        assert!(phi(10_000.0, 100.0, 10.0) > 400.0);
    }

    #[test]
    fn test_zero_deviation() {
        assert_eq!(phi(101.0, 100.0, 0.0), f64::INFINITY);
        assert_eq!(phi(100.0, 100.0, 0.0), 0.0);
    }

    #[test]
    fn test_no_samples_is_infinite() {
        let clock = ManualClock::new(0);
        let fd = AccrualFailureDetector::new(DEFAULT_THRESHOLD, 100, clock.clone());
        assert_eq!(fd.phi("unknown"), f64::INFINITY);
        fd.heartbeat("n1");
        assert_eq!(fd.phi("n1"), f64::INFINITY);
        assert!(fd.check_all().contains("n1"));
    }

    #[test]
    fn test_regular_heartbeats_not_suspected() {
        let clock = ManualClock::new(0);
        let fd = AccrualFailureDetector::new(DEFAULT_THRESHOLD, 100, clock.clone());
        beat_every(&fd, &clock, "n1", &[100, 110, 90, 105, 95, 100]);

        clock.advance(Duration::from_millis(100));
        assert!(!fd.is_suspected("n1"));

        clock.advance(Duration::from_millis(1_000));
        assert!(fd.is_suspected("n1"));
        assert!(fd.check_all().contains("n1"));
    }

    #[test]
    fn test_phi_non_decreasing_with_silence() {
        let clock = ManualClock::new(0);
        let fd = AccrualFailureDetector::new(DEFAULT_THRESHOLD, 100, clock.clone());
        beat_every(&fd, &clock, "n1", &[100, 120, 80, 100]);

        let mut last = fd.phi("n1");
        for _ in 0..100 {
            clock.advance(Duration::from_millis(5));
            let current = fd.phi("n1");
            assert!(current >= last, "{} < {}", current, last);
            last = current;
        }
    }
}
