//! Counters for the proof pool.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated pool metrics, shared as `Arc<Metrics>`.
pub struct Metrics {
    /// Proofs that made it into the store as pending records.
    pub proofs_requested: AtomicU64,
    /// Sub-batches that failed (network, rejection, timeout, parse).
    pub sub_batches_failed: AtomicU64,
    /// Fulfillments that activated a pending record.
    pub fulfillments_applied: AtomicU64,
    /// Redelivered fulfillments ignored as no-ops.
    pub fulfillments_duplicate: AtomicU64,
    /// Fulfillments for request ids this instance does not track.
    pub fulfillments_unknown: AtomicU64,
    /// Proofs handed out to game logic.
    pub proofs_consumed: AtomicU64,
    /// `acquire` calls that found no active proof.
    pub exhaustions: AtomicU64,
    /// Refills that issued a proof request.
    pub refills_triggered: AtomicU64,
    /// Refill triggers folded into one already in flight.
    pub refills_coalesced: AtomicU64,
    /// Sum of request-to-fulfillment latencies in milliseconds.
    pub fulfillment_latency_sum_ms: AtomicU64,
    /// Number of fulfillments contributing to the latency sum.
    pub fulfillment_count: AtomicU64,
}

impl Metrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self {
            proofs_requested: AtomicU64::new(0),
            sub_batches_failed: AtomicU64::new(0),
            fulfillments_applied: AtomicU64::new(0),
            fulfillments_duplicate: AtomicU64::new(0),
            fulfillments_unknown: AtomicU64::new(0),
            proofs_consumed: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
            refills_triggered: AtomicU64::new(0),
            refills_coalesced: AtomicU64::new(0),
            fulfillment_latency_sum_ms: AtomicU64::new(0),
            fulfillment_count: AtomicU64::new(0),
        }
    }

    pub fn record_requested(&self, count: u64) {
        self.proofs_requested.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_sub_batch_failure(&self) {
        self.sub_batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an applied fulfillment with its latency, if known.
    pub fn record_fulfillment(&self, latency_ms: Option<u64>) {
        self.fulfillments_applied.fetch_add(1, Ordering::Relaxed);
        if let Some(ms) = latency_ms {
            self.fulfillment_latency_sum_ms
                .fetch_add(ms, Ordering::Relaxed);
            self.fulfillment_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_duplicate_fulfillment(&self) {
        self.fulfillments_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_fulfillment(&self) {
        self.fulfillments_unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consumed(&self) {
        self.proofs_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhaustion(&self) {
        self.exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refill(&self) {
        self.refills_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.refills_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// Average fulfillment latency in milliseconds, or 0 if none.
    pub fn avg_latency_ms(&self) -> u64 {
        let count = self.fulfillment_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.fulfillment_latency_sum_ms.load(Ordering::Relaxed) / count
    }

    /// Serialize metrics as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "proofs_requested": self.proofs_requested.load(Ordering::Relaxed),
            "sub_batches_failed": self.sub_batches_failed.load(Ordering::Relaxed),
            "fulfillments_applied": self.fulfillments_applied.load(Ordering::Relaxed),
            "fulfillments_duplicate": self.fulfillments_duplicate.load(Ordering::Relaxed),
            "fulfillments_unknown": self.fulfillments_unknown.load(Ordering::Relaxed),
            "proofs_consumed": self.proofs_consumed.load(Ordering::Relaxed),
            "exhaustions": self.exhaustions.load(Ordering::Relaxed),
            "refills_triggered": self.refills_triggered.load(Ordering::Relaxed),
            "refills_coalesced": self.refills_coalesced.load(Ordering::Relaxed),
            "avg_fulfillment_latency_ms": self.avg_latency_ms(),
            "fulfillment_count": self.fulfillment_count.load(Ordering::Relaxed),
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency_ignores_unknown_latencies() {
        let m = Metrics::new();
        assert_eq!(m.avg_latency_ms(), 0);
        m.record_fulfillment(Some(100));
        m.record_fulfillment(Some(300));
        m.record_fulfillment(None);
        assert_eq!(m.avg_latency_ms(), 200);
        assert_eq!(m.to_json()["fulfillments_applied"], 3);
    }
}
