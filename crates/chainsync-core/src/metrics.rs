//! Indexing metrics sink.
//!
//! Each service instance owns its own [`IndexingMetrics`]; nothing here is
//! global, so several services can run side by side in one process.
//!
//! ## Metrics
//! - `matched_events` (counter per label): every event a source filter matched
//! - `handled_events` (counter per label): matched events with a registered handler
//! - `processed_events` (counter per label): handled events whose handler succeeded
//! - `latest_processed_timestamp` (gauge): the watermark, `0` after reset
//! - `reorgs` (counter): rewinds actually performed
//!
//! Labels are `"<source>:<event>"`, plus `"setup"`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub matched_events: BTreeMap<String, u64>,
    pub handled_events: BTreeMap<String, u64>,
    pub processed_events: BTreeMap<String, u64>,
    pub latest_processed_timestamp: u64,
    pub reorgs: u64,
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Matched,
    Handled,
    Processed,
}

impl MetricsSnapshot {
    fn counter(&self, kind: Counter) -> &BTreeMap<String, u64> {
        match kind {
            Counter::Matched => &self.matched_events,
            Counter::Handled => &self.handled_events,
            Counter::Processed => &self.processed_events,
        }
    }

    fn counter_mut(&mut self, kind: Counter) -> &mut BTreeMap<String, u64> {
        match kind {
            Counter::Matched => &mut self.matched_events,
            Counter::Handled => &mut self.handled_events,
            Counter::Processed => &mut self.processed_events,
        }
    }
}

/// Per-instance metrics handle.
#[derive(Debug, Default)]
pub struct IndexingMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl IndexingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, kind: Counter, label: &str, count: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counter_mut(kind).entry(label.to_string()).or_default() += count;
    }

    fn get(&self, kind: Counter, label: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.counter(kind).get(label).copied().unwrap_or(0)
    }

    pub fn record_matched(&self, label: &str, count: u64) {
        self.add(Counter::Matched, label, count);
    }

    pub fn record_handled(&self, label: &str) {
        self.add(Counter::Handled, label, 1);
    }

    pub fn record_processed(&self, label: &str) {
        self.add(Counter::Processed, label, 1);
    }

    pub fn set_latest_processed_timestamp(&self, timestamp: u64) {
        self.inner.lock().unwrap().latest_processed_timestamp = timestamp;
    }

    pub fn record_reorg(&self) {
        self.inner.lock().unwrap().reorgs += 1;
    }

    /// Zero every counter and the gauge (labels are dropped, not just zeroed).
    pub fn reset(&self) {
        *self.inner.lock().unwrap() = MetricsSnapshot::default();
    }

    pub fn matched(&self, label: &str) -> u64 {
        self.get(Counter::Matched, label)
    }

    pub fn handled(&self, label: &str) -> u64 {
        self.get(Counter::Handled, label)
    }

    pub fn processed(&self, label: &str) -> u64 {
        self.get(Counter::Processed, label)
    }

    pub fn latest_processed_timestamp(&self) -> u64 {
        self.inner.lock().unwrap().latest_processed_timestamp
    }

    pub fn reorgs(&self) -> u64 {
        self.inner.lock().unwrap().reorgs
    }

    /// Returns a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().unwrap().clone()
    }
}
