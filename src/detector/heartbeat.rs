//! Per-peer heartbeat bookkeeping

use crate::common::NodeId;
use std::collections::{HashMap, VecDeque};

/// Arrival history of one peer
///
/// Only the receiving node mutates it. Keeps the last `capacity` inter-arrival
/// intervals (milliseconds).
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub peer_id: NodeId,
    /// Clock time of the latest heartbeat, `None` until one arrives
    pub last_seen: Option<u64>,
    intervals: VecDeque<u64>,
    capacity: usize,
}

impl HeartbeatRecord {
    pub fn new(peer_id: impl Into<NodeId>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            peer_id: peer_id.into(),
            last_seen: None,
            intervals: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an arrival at `now`, returning the interval since the last one
    pub fn record(&mut self, now: u64) -> Option<u64> {
        let interval = self.last_seen.map(|last| now.saturating_sub(last));
        if let Some(interval) = interval {
            if self.intervals.len() == self.capacity {
                self.intervals.pop_front();
            }
            self.intervals.push_back(interval);
        }
        self.last_seen = Some(self.last_seen.map_or(now, |last| last.max(now)));
        interval
    }

    pub fn intervals(&self) -> impl Iterator<Item = u64> + '_ {
        self.intervals.iter().copied()
    }

    pub fn sample_count(&self) -> usize {
        self.intervals.len()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.intervals.is_empty() {
            return None;
        }
        let sum: u64 = self.intervals.iter().sum();
        Some(sum as f64 / self.intervals.len() as f64)
    }

    /// Population standard deviation of the window
    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = self
            .intervals
            .iter()
            .map(|&i| {
                let d = i as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / self.intervals.len() as f64;
        Some(variance.sqrt())
    }

    /// Milliseconds since the last heartbeat
    pub fn elapsed(&self, now: u64) -> Option<u64> {
        self.last_seen.map(|last| now.saturating_sub(last))
    }
}

/// Heartbeat records of every monitored peer
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    window_size: usize,
    records: HashMap<NodeId, HeartbeatRecord>,
}

impl HeartbeatTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            records: HashMap::new(),
        }
    }

    /// Start monitoring `peer` before its first heartbeat
    pub fn watch_peer(&mut self, peer: &str) {
        if !self.records.contains_key(peer) {
            self.records
                .insert(peer.to_string(), HeartbeatRecord::new(peer, self.window_size));
        }
    }

    pub fn record(&mut self, peer: &str, now: u64) -> Option<u64> {
        self.watch_peer(peer);
        self.records.get_mut(peer).and_then(|r| r.record(now))
    }

    pub fn get(&self, peer: &str) -> Option<&HeartbeatRecord> {
        self.records.get(peer)
    }

    pub fn records(&self) -> impl Iterator<Item = &HeartbeatRecord> {
        self.records.values()
    }

    pub fn remove(&mut self, peer: &str) -> Option<HeartbeatRecord> {
        self.records.remove(peer)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
