//! Structured counters exposed to external observers (C10).
//!
//! A plain struct of atomics shared via `Arc`, incremented in-line by the
//! component that observes the event, generalized from the teacher's
//! per-cycle `AtomicStats` to a process-lifetime collaborator.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct RunningMean {
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl RunningMean {
    fn observe(&self, value_ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_ms.load(Ordering::Relaxed);
        HistogramSnapshot {
            count,
            mean_ms: if count == 0 { 0.0 } else { sum as f64 / count as f64 },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub mean_ms: f64,
}

#[derive(Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub retries_total: AtomicU64,
    pub fallbacks_used: AtomicU64,
    pub events_counted: AtomicU64,
    pub batches_created: AtomicU64,
    pub blocks_mined: AtomicU64,
    pub blocks_submitted: AtomicU64,
    pub blocks_confirmed: AtomicU64,
    pub tx_failed: AtomicU64,

    request_duration_ms: RunningMean,
    mining_duration_ms: RunningMean,
    confirmation_duration_ms: RunningMean,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub retries_total: u64,
    pub fallbacks_used: u64,
    pub events_counted: u64,
    pub batches_created: u64,
    pub blocks_mined: u64,
    pub blocks_submitted: u64,
    pub blocks_confirmed: u64,
    pub tx_failed: u64,
    pub request_duration_ms: HistogramSnapshot,
    pub mining_duration_ms: HistogramSnapshot,
    pub confirmation_duration_ms: HistogramSnapshot,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, success: bool, retries: u32, fallback_used: bool, duration_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        }
        self.retries_total.fetch_add(retries as u64, Ordering::Relaxed);
        if fallback_used {
            self.fallbacks_used.fetch_add(1, Ordering::Relaxed);
        }
        self.request_duration_ms.observe(duration_ms);
    }

    pub fn record_event_counted(&self) {
        self.events_counted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_created(&self) {
        self.batches_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_mined(&self, duration_ms: u64) {
        self.blocks_mined.fetch_add(1, Ordering::Relaxed);
        self.mining_duration_ms.observe(duration_ms);
    }

    pub fn record_block_submitted(&self) {
        self.blocks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_confirmed(&self, duration_ms: u64) {
        self.blocks_confirmed.fetch_add(1, Ordering::Relaxed);
        self.confirmation_duration_ms.observe(duration_ms);
    }

    pub fn record_tx_failed(&self) {
        self.tx_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            fallbacks_used: self.fallbacks_used.load(Ordering::Relaxed),
            events_counted: self.events_counted.load(Ordering::Relaxed),
            batches_created: self.batches_created.load(Ordering::Relaxed),
            blocks_mined: self.blocks_mined.load(Ordering::Relaxed),
            blocks_submitted: self.blocks_submitted.load(Ordering::Relaxed),
            blocks_confirmed: self.blocks_confirmed.load(Ordering::Relaxed),
            tx_failed: self.tx_failed.load(Ordering::Relaxed),
            request_duration_ms: self.request_duration_ms.snapshot(),
            mining_duration_ms: self.mining_duration_ms.snapshot(),
            confirmation_duration_ms: self.confirmation_duration_ms.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_calls() {
        let metrics = Metrics::new();
        metrics.record_request(true, 2, false, 120);
        metrics.record_request(false, 0, true, 80);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_success, 1);
        assert_eq!(snapshot.retries_total, 2);
        assert_eq!(snapshot.fallbacks_used, 1);
        assert_eq!(snapshot.request_duration_ms.count, 2);
        assert!((snapshot.request_duration_ms.mean_ms - 100.0).abs() < 1e-9);
    }
}
