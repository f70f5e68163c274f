//! Shared liveness state consulted by `/healthz`, per spec.md §7: "unhealthy
//! when C2 has been unable to read for longer than a threshold, or C4 is in
//! prolonged backoff." The tailer and each partition worker update this from
//! their own threads; `health.rs` only ever reads it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One partition worker's backoff bookkeeping: zero means "not currently
/// backing off," any other value is the unix time it entered backoff.
struct PartitionState {
    backoff_since_unix: AtomicU64,
}

pub struct HealthState {
    last_tailer_read_unix: AtomicU64,
    partitions: Vec<PartitionState>,
}

impl HealthState {
    pub fn new(partition_count: usize) -> Arc<HealthState> {
        Arc::new(HealthState {
            last_tailer_read_unix: AtomicU64::new(now_unix_secs()),
            partitions: (0..partition_count.max(1))
                .map(|_| PartitionState {
                    backoff_since_unix: AtomicU64::new(0),
                })
                .collect(),
        })
    }

    /// Called by the tailer after every read cycle that completes without
    /// an error (a fresh document, or a clean tailable-await timeout with
    /// nothing new) — i.e. whenever Mongo is demonstrably still reachable
    /// and responsive, not only when a document actually arrives.
    pub fn record_tailer_read(&self) {
        self.last_tailer_read_unix
            .store(now_unix_secs(), Ordering::Relaxed);
    }

    /// Called by a partition worker on entering `WorkerState::Backoff`.
    /// Idempotent across repeated retries within the same backoff episode:
    /// only the first call after leaving `Idle` records a timestamp, so a
    /// worker retrying every few hundred milliseconds doesn't look freshly
    /// healthy on every single attempt.
    pub fn enter_backoff(&self, partition: usize) {
        if let Some(p) = self.partitions.get(partition) {
            p.backoff_since_unix
                .compare_exchange(0, now_unix_secs(), Ordering::Relaxed, Ordering::Relaxed)
                .ok();
        }
    }

    /// Called by a partition worker on a successful publish+checkpoint,
    /// clearing any backoff episode that preceded it.
    pub fn leave_backoff(&self, partition: usize) {
        if let Some(p) = self.partitions.get(partition) {
            p.backoff_since_unix.store(0, Ordering::Relaxed);
        }
    }

    /// Whether the pipeline should currently report healthy.
    pub fn is_healthy(&self, tailer_stall_threshold: Duration, backoff_stall_threshold: Duration) -> bool {
        let now = now_unix_secs();

        let tailer_ok = now.saturating_sub(self.last_tailer_read_unix.load(Ordering::Relaxed))
            < tailer_stall_threshold.as_secs();

        let partitions_ok = self.partitions.iter().all(|p| {
            let since = p.backoff_since_unix.load(Ordering::Relaxed);
            since == 0 || now.saturating_sub(since) < backoff_stall_threshold.as_secs()
        });

        tailer_ok && partitions_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_healthy() {
        let state = HealthState::new(2);
        assert!(state.is_healthy(Duration::from_secs(30), Duration::from_secs(30)));
    }

    #[test]
    fn stale_tailer_read_is_unhealthy() {
        let state = HealthState::new(1);
        state
            .last_tailer_read_unix
            .store(now_unix_secs().saturating_sub(1000), Ordering::Relaxed);
        assert!(!state.is_healthy(Duration::from_secs(30), Duration::from_secs(30)));
    }

    #[test]
    fn prolonged_backoff_is_unhealthy_but_brief_backoff_is_not() {
        let state = HealthState::new(1);
        state.enter_backoff(0);
        assert!(
            state.is_healthy(Duration::from_secs(30), Duration::from_secs(30)),
            "a backoff episode that just started is not yet prolonged"
        );

        state.partitions[0]
            .backoff_since_unix
            .store(now_unix_secs().saturating_sub(1000), Ordering::Relaxed);
        assert!(!state.is_healthy(Duration::from_secs(30), Duration::from_secs(30)));
    }

    #[test]
    fn leaving_backoff_restores_health() {
        let state = HealthState::new(1);
        state.partitions[0]
            .backoff_since_unix
            .store(now_unix_secs().saturating_sub(1000), Ordering::Relaxed);
        assert!(!state.is_healthy(Duration::from_secs(30), Duration::from_secs(30)));

        state.leave_backoff(0);
        assert!(state.is_healthy(Duration::from_secs(30), Duration::from_secs(30)));
    }

    #[test]
    fn enter_backoff_does_not_refresh_an_already_running_episode() {
        let state = HealthState::new(1);
        let stale = now_unix_secs().saturating_sub(1000);
        state.partitions[0]
            .backoff_since_unix
            .store(stale, Ordering::Relaxed);

        state.enter_backoff(0); // should be a no-op: already non-zero
        assert_eq!(
            state.partitions[0].backoff_since_unix.load(Ordering::Relaxed),
            stale
        );
    }
}
