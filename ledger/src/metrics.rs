//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine metrics.
pub struct EngineMetrics {
    /// Submissions received (including reversals and replays).
    pub submitted: AtomicU64,
    /// Transactions applied.
    pub applied: AtomicU64,
    /// Transactions recorded as FAILED.
    pub failed: AtomicU64,
    /// Submissions answered from an existing record.
    pub replayed: AtomicU64,
    /// Reversals applied.
    pub reversals: AtomicU64,
    /// Requests rejected as malformed.
    pub invalid_requests: AtomicU64,
    /// Commits that lost a version race.
    pub version_conflicts: AtomicU64,
    /// Submissions that ran out of attempts.
    pub contention_exhausted: AtomicU64,
    /// Storage calls that failed as unavailable.
    pub storage_errors: AtomicU64,
}

impl EngineMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            reversals: AtomicU64::new(0),
            invalid_requests: AtomicU64::new(0),
            version_conflicts: AtomicU64::new(0),
            contention_exhausted: AtomicU64::new(0),
            storage_errors: AtomicU64::new(0),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            reversals: self.reversals.load(Ordering::Relaxed),
            invalid_requests: self.invalid_requests.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            contention_exhausted: self.contention_exhausted.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("submitted", "Total submissions received", snapshot.submitted),
            ("applied", "Total transactions applied", snapshot.applied),
            ("failed", "Total transactions recorded as failed", snapshot.failed),
            ("replayed", "Total submissions answered by replay", snapshot.replayed),
            ("reversals", "Total reversals applied", snapshot.reversals),
            ("invalid_requests", "Total malformed requests", snapshot.invalid_requests),
            ("version_conflicts", "Total optimistic version conflicts", snapshot.version_conflicts),
            (
                "contention_exhausted",
                "Total submissions that exhausted their attempts",
                snapshot.contention_exhausted,
            ),
            ("storage_errors", "Total storage unavailability errors", snapshot.storage_errors),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP corebank_ledger_{name}_total {help}\n\
                 # TYPE corebank_ledger_{name}_total counter\n\
                 corebank_ledger_{name}_total {value}\n\n"
            ));
        }
        out
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub applied: u64,
    pub failed: u64,
    pub replayed: u64,
    pub reversals: u64,
    pub invalid_requests: u64,
    pub version_conflicts: u64,
    pub contention_exhausted: u64,
    pub storage_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = EngineMetrics::new();

        EngineMetrics::incr(&metrics.submitted);
        EngineMetrics::incr(&metrics.submitted);
        EngineMetrics::incr(&metrics.applied);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.applied, 1);
        assert_eq!(snapshot.failed, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = EngineMetrics::new();
        EngineMetrics::incr(&metrics.version_conflicts);

        let output = metrics.to_prometheus();
        assert!(output.contains("# TYPE corebank_ledger_version_conflicts_total counter"));
        assert!(output.contains("corebank_ledger_version_conflicts_total 1"));
        assert!(output.contains("corebank_ledger_applied_total 0"));
    }
}
