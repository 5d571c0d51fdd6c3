//! Simulation metrics.

use std::collections::VecDeque;

use serde::Serialize;

/// Simulation metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationMetrics {
    /// Distinct transactions attempted.
    pub total_transactions: u64,
    /// Transactions applied.
    pub applied: u64,
    /// Transactions recorded as FAILED.
    pub failed: u64,
    /// Calls that ended in an error after resubmission.
    pub errors: u64,
    /// Duplicate submissions sent.
    pub duplicates: u64,
    /// Reversals applied.
    pub reversals: u64,
    /// Latency samples (microseconds).
    #[serde(skip)]
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    #[serde(skip)]
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_transactions: 0,
            applied: 0,
            failed: 0,
            errors: 0,
            duplicates: 0,
            reversals: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a completed transaction.
    pub fn record_outcome(&mut self, applied: bool, reversal: bool, latency_us: u64) {
        self.total_transactions += 1;
        if applied {
            self.applied += 1;
            if reversal {
                self.reversals += 1;
            }
        } else {
            self.failed += 1;
        }

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    /// Record a call that ended in an error.
    pub fn record_error(&mut self) {
        self.total_transactions += 1;
        self.errors += 1;
    }

    /// Record a duplicate submission.
    pub fn record_duplicate(&mut self) {
        self.duplicates += 1;
    }

    /// Get average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p50 latency.
    pub fn p50_latency_us(&self) -> u64 {
        self.percentile_latency(50)
    }

    /// Get p99 latency.
    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get throughput (transactions per second).
    pub fn throughput(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }

        self.total_transactions as f64 / elapsed_secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
