//! In-memory taxi liveness view.
//!
//! The store is authoritative for taxi state; each dispatcher keeps only this
//! rebuilt-on-start map of last-heard monotonic timestamps. Heartbeat and
//! position ingestion stamp it, the timeout sweep drains it.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct LivenessView {
    last_seen: HashMap<i64, Instant>,
}

impl LivenessView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self, taxi_id: i64) {
        self.stamp_at(taxi_id, Instant::now());
    }

    pub fn stamp_at(&mut self, taxi_id: i64, at: Instant) {
        self.last_seen.insert(taxi_id, at);
    }

    pub fn last_seen(&self, taxi_id: i64) -> Option<Instant> {
        self.last_seen.get(&taxi_id).copied()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// Remove and return every taxi not heard from within `timeout`, sorted
    /// for deterministic logging.
    pub fn sweep(&mut self, timeout: Duration) -> Vec<i64> {
        self.sweep_at(Instant::now(), timeout)
    }

    pub fn sweep_at(&mut self, now: Instant, timeout: Duration) -> Vec<i64> {
        let mut expired: Vec<i64> = self
            .last_seen
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in &expired {
            self.last_seen.remove(id);
        }
        expired
    }
}
