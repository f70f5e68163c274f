//! The metrics surface. Definitions only: counters, a histogram, and
//! the `IntervalMax` gauge primitive. Exposition (the `/metrics` HTTP
//! transport) lives in `health.rs` and is treated as an external
//! collaborator per spec.md §1 — this module only owns what's counted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

/// Outcome label for entries seen by the transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ignored,
    Processed,
    Error,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Ignored => "ignored",
            Status::Processed => "processed",
            Status::Error => "error",
        }
    }
}

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static OPLOG_ENTRIES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "otr_oplog_entries_received",
            "Oplog entries observed by the tailer, by database and outcome.",
        ),
        &["database", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static OPLOG_ENTRIES_RECEIVED_SIZE: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "otr_oplog_entries_received_size",
            "Total BSON byte size of oplog entries observed, by database.",
        ),
        &["database"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Exponential buckets starting at 8 bytes, ratio 2, 29 steps, plus an
/// explicit 0 bucket for empty payloads.
fn size_buckets() -> Vec<f64> {
    let mut buckets = vec![0.0];
    buckets.extend(exponential_buckets(8.0, 2.0, 29).expect("valid exponential bucket params"));
    buckets
}

pub static OPLOG_ENTRIES_BY_SIZE: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "otr_oplog_entries_by_size",
            "Distribution of oplog entry BSON byte sizes, by database and outcome.",
        )
        .buckets(size_buckets()),
        &["database", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static OPLOG_ENTRIES_MAX_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "otr_oplog_entries_max_size",
            "Largest oplog entry BSON byte size observed in the prior 60s interval.",
        ),
        &["database", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static MAX_SIZE_GAUGES: Lazy<Mutex<HashMap<(String, String), IntervalMax>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Records one oplog entry's observed size against all three size
/// metrics plus the received counter, for the given database/status.
pub fn record_entry(database: &str, status: Status, byte_size: u64) {
    OPLOG_ENTRIES_RECEIVED
        .with_label_values(&[database, status.as_str()])
        .inc();
    OPLOG_ENTRIES_RECEIVED_SIZE
        .with_label_values(&[database])
        .inc_by(byte_size);
    OPLOG_ENTRIES_BY_SIZE
        .with_label_values(&[database, status.as_str()])
        .observe(byte_size as f64);

    let key = (database.to_string(), status.as_str().to_string());
    let mut gauges = MAX_SIZE_GAUGES.lock().expect("metrics mutex not poisoned");
    let gauge = gauges.entry(key.clone()).or_insert_with(IntervalMax::new);
    if let Some(rolled_over) = gauge.observe(byte_size) {
        OPLOG_ENTRIES_MAX_SIZE
            .with_label_values(&[&key.0, &key.1])
            .set(rolled_over as i64);
    }
}

/// A gauge that reports the maximum observation from the *previous*
/// rollover interval, rather than a running maximum. Every 60s the
/// current interval's max becomes the reported value and a fresh
/// interval starts collecting.
///
/// This avoids two failure modes a naive running-max gauge has: it
/// never resets to a stale high-water mark from hours ago, and it never
/// flickers down mid-interval just because nothing large happened yet.
pub struct IntervalMax {
    interval: Duration,
    window_start: Instant,
    current_max: u64,
}

impl IntervalMax {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(60))
    }

    pub fn with_interval(interval: Duration) -> Self {
        IntervalMax {
            interval,
            window_start: Instant::now(),
            current_max: 0,
        }
    }

    /// Record an observation. Returns `Some(previous_interval_max)` the
    /// first time this call detects that the rollover interval has
    /// elapsed, so the caller can push that value into a gauge.
    pub fn observe(&mut self, value: u64) -> Option<u64> {
        if self.window_start.elapsed() >= self.interval {
            let rolled_over = self.current_max;
            self.current_max = value;
            self.window_start = Instant::now();
            Some(rolled_over)
        } else {
            self.current_max = self.current_max.max(value);
            None
        }
    }
}

impl Default for IntervalMax {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_nothing_within_the_same_interval() {
        let mut gauge = IntervalMax::with_interval(Duration::from_secs(60));
        assert_eq!(gauge.observe(10), None);
        assert_eq!(gauge.observe(5), None);
        assert_eq!(gauge.observe(20), None);
    }

    #[test]
    fn rolls_over_and_reports_the_prior_max() {
        let mut gauge = IntervalMax::with_interval(Duration::from_millis(10));
        gauge.observe(7);
        gauge.observe(42);
        std::thread::sleep(Duration::from_millis(15));
        let rolled = gauge.observe(3);
        assert_eq!(rolled, Some(42));
    }

    #[test]
    fn status_labels_match_spec() {
        assert_eq!(Status::Ignored.as_str(), "ignored");
        assert_eq!(Status::Processed.as_str(), "processed");
        assert_eq!(Status::Error.as_str(), "error");
    }
}
