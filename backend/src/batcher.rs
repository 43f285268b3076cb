//! Request batcher: turns "N more proofs for this category" into oracle
//! calls.
//!
//! A request is split into sub-batches of at most `max_per_call` proofs,
//! issued in ascending order with a cool-down between calls. Sub-batches
//! succeed or fail independently; records from a successful sub-batch are
//! persisted before the next call goes out, and nothing is rolled back when a
//! later sub-batch fails.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::allocation::{AllocationTable, Category};
use crate::config::PoolSettings;
use crate::correlator::FulfillmentEvent;
use crate::error::{BatchFailureReason, PoolError, PoolResult, SubBatchFailure};
use crate::events::{EventFeed, PoolEvent};
use crate::metrics::Metrics;
use crate::oracle::logs::extract_requests;
use crate::oracle::{CallReceipt, Oracle, OracleError, SignerStatus};
use crate::record::{ProofRecord, RequestId};
use crate::store::ProofStore;

/// Sizes of the sub-batches for `count` proofs: ceiling division, every
/// batch full except possibly the last.
pub fn plan_sub_batches(count: u32, max_per_call: u32) -> Vec<u32> {
    let max = max_per_call.max(1);
    let mut sizes = Vec::with_capacity(count.div_ceil(max) as usize);
    let mut remaining = count;
    while remaining > 0 {
        let size = remaining.min(max);
        sizes.push(size);
        remaining -= size;
    }
    sizes
}

/// Aggregate result of one proof request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub category: Category,
    pub requested: u32,
    /// Pending records created and persisted, in request order.
    pub records: Vec<ProofRecord>,
    pub failed: Vec<SubBatchFailure>,
}

impl BatchOutcome {
    fn new(category: Category, requested: u32) -> Self {
        Self {
            category,
            requested,
            records: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Proofs left unrequested by failed sub-batches.
    pub fn unrequested(&self) -> u32 {
        self.failed.iter().map(|f| f.count).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct RequestBatcher {
    oracle: Arc<dyn Oracle>,
    signer: Arc<dyn SignerStatus>,
    store: Arc<ProofStore>,
    allocations: Arc<AllocationTable>,
    settings: PoolSettings,
    events: EventFeed,
    metrics: Arc<Metrics>,
}

impl RequestBatcher {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        signer: Arc<dyn SignerStatus>,
        store: Arc<ProofStore>,
        allocations: Arc<AllocationTable>,
        settings: PoolSettings,
        events: EventFeed,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            oracle,
            signer,
            store,
            allocations,
            settings,
            events,
            metrics,
        }
    }

    pub fn signer_available(&self) -> bool {
        self.signer.is_available()
    }

    /// Ask the oracle which of `request_ids` it has already fulfilled,
    /// bounded by the call timeout.
    pub async fn lookup_fulfillments(
        &self,
        request_ids: &[RequestId],
    ) -> Result<Vec<FulfillmentEvent>, BatchFailureReason> {
        let lookup = self.oracle.fulfillments(request_ids);
        match tokio::time::timeout(self.settings.call_timeout, lookup).await {
            Err(_) => Err(BatchFailureReason::Timeout),
            Ok(Err(OracleError::Network(msg))) => Err(BatchFailureReason::Network(msg)),
            Ok(Err(OracleError::Rejected(msg))) => Err(BatchFailureReason::Rejected(msg)),
            Ok(Ok(found)) => Ok(found),
        }
    }

    /// Request `count` proofs for `category`.
    ///
    /// Fails as a whole only for bad input or a missing signer; per-call
    /// failures are reported in [`BatchOutcome::failed`].
    pub async fn request_proofs(&self, category: &Category, count: u32) -> PoolResult<BatchOutcome> {
        if count == 0 {
            return Err(PoolError::InvalidCount);
        }
        self.allocations.allocation_for(category)?;
        if !self.signer.is_available() {
            return Err(PoolError::SignerUnavailable);
        }

        let sizes = plan_sub_batches(count, self.settings.max_per_call);
        info!(
            category = %category,
            count,
            sub_batches = sizes.len(),
            "Requesting proofs"
        );

        let mut outcome = BatchOutcome::new(category.clone(), count);
        let mut next_label = 1u32;
        for (index, &size) in sizes.iter().enumerate() {
            if index > 0 && !self.settings.batch_cooldown.is_zero() {
                tokio::time::sleep(self.settings.batch_cooldown).await;
            }

            let labels: Vec<String> = (next_label..next_label + size)
                .map(|n| category.label(n))
                .collect();
            next_label += size;

            if !self.signer.is_available() {
                self.fail(&mut outcome, index, size, BatchFailureReason::SignerUnavailable);
                continue;
            }

            let category_ids = vec![category.family.id(); labels.len()];
            let call = self.oracle.request_batch(&category_ids, &labels);
            match tokio::time::timeout(self.settings.call_timeout, call).await {
                Err(_) => self.fail(&mut outcome, index, size, BatchFailureReason::Timeout),
                Ok(Err(OracleError::Network(msg))) => {
                    self.fail(&mut outcome, index, size, BatchFailureReason::Network(msg))
                }
                Ok(Err(OracleError::Rejected(msg))) => {
                    self.fail(&mut outcome, index, size, BatchFailureReason::Rejected(msg))
                }
                Ok(Ok(receipt)) => {
                    self.record_receipt(&mut outcome, index, &labels, receipt)
                        .await
                }
            }
        }

        info!(
            category = %category,
            requested = count,
            created = outcome.records.len(),
            failed_sub_batches = outcome.failed.len(),
            "Proof request finished"
        );
        Ok(outcome)
    }

    /// Run several requests in category order, so that every variant of a
    /// family is requested before the next family begins.
    pub async fn request_many(
        &self,
        requests: &[(Category, u32)],
    ) -> Vec<(Category, PoolResult<BatchOutcome>)> {
        let mut ordered = requests.to_vec();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        let mut results = Vec::with_capacity(ordered.len());
        for (i, (category, count)) in ordered.into_iter().enumerate() {
            if i > 0 && !self.settings.batch_cooldown.is_zero() {
                tokio::time::sleep(self.settings.batch_cooldown).await;
            }
            let result = self.request_proofs(&category, count).await;
            results.push((category, result));
        }
        results
    }

    /// Create one pending record per accepted entry that belongs to this
    /// sub-batch.
    async fn record_receipt(
        &self,
        outcome: &mut BatchOutcome,
        index: usize,
        labels: &[String],
        receipt: CallReceipt,
    ) {
        let size = labels.len() as u32;
        let entries = match extract_requests(&receipt.logs) {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) => {
                let reason = BatchFailureReason::ReceiptParse(format!(
                    "no request entries in {}",
                    receipt.transaction_ref
                ));
                self.fail(outcome, index, size, reason);
                return;
            }
            Err(msg) => {
                self.fail(outcome, index, size, BatchFailureReason::ReceiptParse(msg));
                return;
            }
        };

        let category = outcome.category.clone();
        let mut expected: HashSet<&str> = labels.iter().map(String::as_str).collect();
        let mut shortfall_reason = None;
        let mut created = 0u32;

        for entry in entries {
            if entry.category_id != category.family.id() || !expected.remove(entry.label.as_str()) {
                warn!(
                    request_id = entry.request_id,
                    label = %entry.label,
                    tx = %receipt.transaction_ref,
                    "Receipt entry does not belong to this sub-batch, skipping"
                );
                continue;
            }

            let record = ProofRecord::pending(
                &category,
                entry.label,
                entry.request_id,
                receipt.transaction_ref.clone(),
                receipt.block_ref,
            );
            match self.store.put(record.clone()).await {
                Ok(()) => {
                    created += 1;
                    self.events.emit(PoolEvent::RecordCreated {
                        id: record.id,
                        category: category.clone(),
                        request_id: record.request_id,
                    });
                    outcome.records.push(record);
                }
                Err(PoolError::DuplicateRequestId(request_id)) => {
                    error!(
                        request_id,
                        tx = %receipt.transaction_ref,
                        "Oracle reported a request id that is already live; skipping record"
                    );
                    shortfall_reason.get_or_insert(BatchFailureReason::ReceiptParse(format!(
                        "duplicate request id {request_id}"
                    )));
                }
                Err(e) => {
                    error!(request_id = entry.request_id, error = %e, "Failed to persist pending record");
                    shortfall_reason.get_or_insert(BatchFailureReason::Storage(e.to_string()));
                }
            }
        }

        self.metrics.record_requested(u64::from(created));
        let missing = size - created;
        if missing > 0 {
            let reason = shortfall_reason.unwrap_or_else(|| {
                BatchFailureReason::ReceiptParse(format!(
                    "receipt reported {created} of {size} requests"
                ))
            });
            self.fail(outcome, index, missing, reason);
        }
    }

    fn fail(&self, outcome: &mut BatchOutcome, index: usize, count: u32, reason: BatchFailureReason) {
        warn!(
            category = %outcome.category,
            sub_batch = index,
            count,
            reason = %reason,
            "Sub-batch failed"
        );
        self.metrics.record_sub_batch_failure();
        self.events.emit(PoolEvent::BatchFailed {
            category: outcome.category.clone(),
            index,
            count,
            reason: reason.to_string(),
        });
        outcome.failed.push(SubBatchFailure {
            category: outcome.category.clone(),
            index,
            count,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::GameFamily;
    use crate::oracle::fake::{FakeFailure, FakeOracle};
    use crate::record::ProofState;
    use crate::store::MemoryBackend;
    use std::time::Duration;

    fn settings() -> PoolSettings {
        PoolSettings {
            max_per_call: 25,
            batch_cooldown: Duration::ZERO,
            call_timeout: Duration::from_millis(200),
            refill_interval: Duration::from_secs(60),
            retention: None,
        }
    }

    async fn batcher(oracle: Arc<FakeOracle>) -> (RequestBatcher, Arc<ProofStore>) {
        let store = Arc::new(ProofStore::open(Arc::new(MemoryBackend::new())).await.unwrap());
        let batcher = RequestBatcher::new(
            oracle.clone(),
            oracle,
            store.clone(),
            Arc::new(AllocationTable::default()),
            settings(),
            EventFeed::new(),
            Arc::new(Metrics::new()),
        );
        (batcher, store)
    }

    fn mines() -> Category {
        Category::family(GameFamily::Mines)
    }

    #[test]
    fn splits_into_ceiling_sub_batches() {
        assert_eq!(plan_sub_batches(70, 25), vec![25, 25, 20]);
        assert_eq!(plan_sub_batches(50, 25), vec![25, 25]);
        assert_eq!(plan_sub_batches(1, 25), vec![1]);
        assert!(plan_sub_batches(0, 25).is_empty());
    }

    #[tokio::test]
    async fn seventy_proofs_take_three_calls() {
        let oracle = Arc::new(FakeOracle::new());
        let (batcher, store) = batcher(oracle.clone()).await;

        let outcome = batcher.request_proofs(&mines(), 70).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(oracle.call_sizes(), vec![25, 25, 20]);
        assert_eq!(outcome.records.len(), 70);
        assert_eq!(store.count_pending(&mines()).await, 70);

        let labels: Vec<&str> = outcome.records.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels[0], "mines_1");
        assert_eq!(labels[25], "mines_26");
        assert_eq!(labels[69], "mines_70");
        assert!(outcome.records.iter().all(|r| r.state == ProofState::Pending));
    }

    #[tokio::test]
    async fn failed_sub_batch_keeps_earlier_records() {
        let oracle = Arc::new(FakeOracle::new());
        oracle.fail_call(1, FakeFailure::Stall);
        let (batcher, store) = batcher(oracle.clone()).await;

        let outcome = batcher.request_proofs(&mines(), 50).await.unwrap();
        assert_eq!(outcome.records.len(), 25);
        assert_eq!(
            outcome.failed,
            vec![SubBatchFailure {
                category: mines(),
                index: 1,
                count: 25,
                reason: BatchFailureReason::Timeout,
            }]
        );
        assert_eq!(store.count_pending(&mines()).await, 25);
    }

    #[tokio::test]
    async fn later_sub_batches_run_after_a_failure() {
        let oracle = Arc::new(FakeOracle::new());
        oracle.fail_call(0, FakeFailure::Network);
        let (batcher, _) = batcher(oracle.clone()).await;

        let outcome = batcher.request_proofs(&mines(), 30).await.unwrap();
        assert_eq!(outcome.records.len(), 5);
        assert_eq!(outcome.unrequested(), 25);
        assert!(matches!(outcome.failed[0].reason, BatchFailureReason::Network(_)));
    }

    #[tokio::test]
    async fn empty_receipt_stores_nothing() {
        let oracle = Arc::new(FakeOracle::new());
        oracle.fail_call(0, FakeFailure::EmptyReceipt);
        let (batcher, store) = batcher(oracle).await;

        let outcome = batcher.request_proofs(&mines(), 3).await.unwrap();
        assert!(outcome.records.is_empty());
        assert!(matches!(outcome.failed[0].reason, BatchFailureReason::ReceiptParse(_)));
        assert_eq!(store.counts(&mines()).await.total(), 0);
    }

    #[tokio::test]
    async fn short_receipt_reports_the_shortfall() {
        let oracle = Arc::new(FakeOracle::new());
        oracle.fail_call(0, FakeFailure::ShortReceipt(2));
        let (batcher, _) = batcher(oracle).await;

        let outcome = batcher.request_proofs(&mines(), 5).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.failed[0].count, 3);
    }

    #[tokio::test]
    async fn rejects_bad_requests_up_front() {
        let oracle = Arc::new(FakeOracle::new());
        let store = Arc::new(ProofStore::open(Arc::new(MemoryBackend::new())).await.unwrap());
        let batcher = RequestBatcher::new(
            oracle.clone(),
            oracle.clone(),
            store,
            Arc::new(AllocationTable::parse("MINES=50:25").unwrap()),
            settings(),
            EventFeed::new(),
            Arc::new(Metrics::new()),
        );

        assert_eq!(batcher.request_proofs(&mines(), 0).await, Err(PoolError::InvalidCount));
        assert!(matches!(
            batcher
                .request_proofs(&Category::family(GameFamily::Wheel), 1)
                .await,
            Err(PoolError::UnknownCategory(_))
        ));

        oracle.set_signer_available(false);
        assert_eq!(
            batcher.request_proofs(&mines(), 1).await,
            Err(PoolError::SignerUnavailable)
        );
        assert!(oracle.call_sizes().is_empty());
    }

    #[tokio::test]
    async fn request_many_runs_in_category_order() {
        let oracle = Arc::new(FakeOracle::new());
        let store = Arc::new(ProofStore::open(Arc::new(MemoryBackend::new())).await.unwrap());
        let table = AllocationTable::parse("WHEEL=10:5,MINES/b=10:5,MINES/a=10:5").unwrap();
        let batcher = RequestBatcher::new(
            oracle.clone(),
            oracle.clone(),
            store,
            Arc::new(table),
            settings(),
            EventFeed::new(),
            Arc::new(Metrics::new()),
        );

        let results = batcher
            .request_many(&[
                (Category::family(GameFamily::Wheel), 1),
                (Category::variant(GameFamily::Mines, "b"), 2),
                (Category::variant(GameFamily::Mines, "a"), 3),
            ])
            .await;
        let order: Vec<String> = results.iter().map(|(c, _)| c.to_string()).collect();
        assert_eq!(order, ["mines/a", "mines/b", "wheel"]);
        assert_eq!(oracle.call_sizes(), vec![3, 2, 1]);

        let (_, first) = &results[0];
        assert_eq!(first.as_ref().unwrap().records[0].label, "mines_a_1");
    }
}
