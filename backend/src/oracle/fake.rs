//! In-process coordinator for demos and tests.
//!
//! Speaks the same receipt and event format as the real coordinator, so the
//! pool's parsing paths run unchanged. Randomness comes from
//! [`compute_randomness`] keyed by a local secret.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::logs::RequestAccepted;
use super::{CallReceipt, Oracle, OracleError, SignerStatus};
use crate::correlator::FulfillmentEvent;
use crate::record::RequestId;
use crate::vrf::compute_randomness;

/// Scripted misbehaviour for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeFailure {
    Network,
    Rejected,
    /// Never return; the caller's timeout fires.
    Stall,
    /// Succeed with a receipt that carries no request entries.
    EmptyReceipt,
    /// Succeed but only report the first `n` entries.
    ShortReceipt(usize),
}

struct AutoFulfill {
    tx: mpsc::Sender<FulfillmentEvent>,
    delay: Duration,
}

pub struct FakeOracle {
    secret: Vec<u8>,
    next_request_id: AtomicU64,
    slot: AtomicU64,
    signer_available: AtomicBool,
    calls: Mutex<Vec<usize>>,
    failures: Mutex<HashMap<usize, FakeFailure>>,
    issued: Mutex<Vec<RequestId>>,
    gate: watch::Sender<bool>,
    auto_fulfill: Option<AutoFulfill>,
}

impl FakeOracle {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            secret: b"fake-oracle-secret".to_vec(),
            next_request_id: AtomicU64::new(1),
            slot: AtomicU64::new(1_000),
            signer_available: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            issued: Mutex::new(Vec::new()),
            gate,
            auto_fulfill: None,
        }
    }

    /// Deliver fulfillments for every accepted call on `tx` after `delay`,
    /// newest request first.
    pub fn with_auto_fulfill(mut self, tx: mpsc::Sender<FulfillmentEvent>, delay: Duration) -> Self {
        self.auto_fulfill = Some(AutoFulfill { tx, delay });
        self
    }

    /// Script a failure for the call with this zero-based index.
    pub fn fail_call(&self, index: usize, failure: FakeFailure) {
        lock(&self.failures).insert(index, failure);
    }

    pub fn set_signer_available(&self, available: bool) {
        self.signer_available.store(available, Ordering::SeqCst);
    }

    /// Block new calls until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Sizes of every call attempted so far, in order.
    pub fn call_sizes(&self) -> Vec<usize> {
        lock(&self.calls).clone()
    }

    /// The notification the coordinator would emit for `request_id`.
    pub fn fulfillment(&self, request_id: RequestId) -> FulfillmentEvent {
        let seed = [0x5a; 32];
        FulfillmentEvent {
            request_id,
            random_value: compute_randomness(&self.secret, &seed, request_id, request_id),
        }
    }

    /// Fulfillments for every request issued since the last drain, in
    /// request order.
    pub fn drain_fulfillments(&self) -> Vec<FulfillmentEvent> {
        let issued = std::mem::take(&mut *lock(&self.issued));
        issued.into_iter().map(|id| self.fulfillment(id)).collect()
    }
}

impl Default for FakeOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Oracle for FakeOracle {
    async fn request_batch(
        &self,
        category_ids: &[u8],
        labels: &[String],
    ) -> Result<CallReceipt, OracleError> {
        let index = {
            let mut calls = lock(&self.calls);
            calls.push(labels.len());
            calls.len() - 1
        };

        let mut gate = self.gate.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = gate.wait_for(|open| *open).await;

        let failure = lock(&self.failures).remove(&index);
        match failure {
            Some(FakeFailure::Network) => {
                return Err(OracleError::Network("connection reset by peer".into()));
            }
            Some(FakeFailure::Rejected) => {
                return Err(OracleError::Rejected("custom program error: 0x1771".into()));
            }
            Some(FakeFailure::Stall) => std::future::pending::<()>().await,
            _ => {}
        }

        let slot = self.slot.fetch_add(1, Ordering::SeqCst);
        let transaction_ref = format!("fake-tx-{index}");
        let reported = match failure {
            Some(FakeFailure::EmptyReceipt) => 0,
            Some(FakeFailure::ShortReceipt(n)) => n.min(labels.len()),
            _ => labels.len(),
        };

        let mut logs = vec!["Program fake invoke [1]".to_string()];
        let mut accepted = Vec::with_capacity(labels.len());
        for (i, (category_id, label)) in category_ids.iter().zip(labels).enumerate() {
            let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
            accepted.push(request_id);
            if i < reported {
                logs.push(
                    RequestAccepted {
                        request_id,
                        category_id: *category_id,
                        label: label.clone(),
                        requester: [1u8; 32],
                    }
                    .to_log_line(),
                );
            }
        }
        logs.push("Program fake success".to_string());

        lock(&self.issued).extend(accepted.iter().copied());
        debug!(index, count = labels.len(), slot, "Fake oracle accepted batch");

        if let Some(auto) = &self.auto_fulfill {
            let events: Vec<FulfillmentEvent> =
                accepted.iter().rev().map(|id| self.fulfillment(*id)).collect();
            let tx = auto.tx.clone();
            let delay = auto.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
        }

        Ok(CallReceipt {
            transaction_ref,
            block_ref: slot,
            logs,
        })
    }

    /// Every accepted request counts as fulfilled on the coordinator,
    /// whether or not its notification was ever delivered.
    async fn fulfillments(
        &self,
        request_ids: &[RequestId],
    ) -> Result<Vec<FulfillmentEvent>, OracleError> {
        let next = self.next_request_id.load(Ordering::SeqCst);
        Ok(request_ids
            .iter()
            .filter(|id| (1..next).contains(*id))
            .map(|id| self.fulfillment(*id))
            .collect())
    }
}

impl SignerStatus for FakeOracle {
    fn is_available(&self) -> bool {
        self.signer_available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::logs::extract_requests;

    fn labels(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("mines_{i}")).collect()
    }

    #[tokio::test]
    async fn receipts_carry_one_entry_per_label() {
        let oracle = FakeOracle::new();
        let receipt = oracle.request_batch(&[0, 0, 0], &labels(3)).await.unwrap();
        let entries = extract_requests(&receipt.logs).unwrap();
        assert_eq!(
            entries.iter().map(|e| e.request_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(entries[2].label, "mines_3");
        assert_eq!(oracle.drain_fulfillments().len(), 3);
        assert!(oracle.drain_fulfillments().is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_apply_once() {
        let oracle = FakeOracle::new();
        oracle.fail_call(0, FakeFailure::Rejected);
        assert!(matches!(
            oracle.request_batch(&[1], &labels(1)).await,
            Err(OracleError::Rejected(_))
        ));
        assert!(oracle.request_batch(&[1], &labels(1)).await.is_ok());
        assert_eq!(oracle.call_sizes(), vec![1, 1]);
    }

    #[tokio::test]
    async fn fulfillments_are_deterministic() {
        let oracle = FakeOracle::new();
        assert_eq!(oracle.fulfillment(5), oracle.fulfillment(5));
        assert_ne!(oracle.fulfillment(5).random_value, oracle.fulfillment(6).random_value);
    }

    #[tokio::test]
    async fn lookup_reports_only_accepted_requests() {
        let oracle = FakeOracle::new();
        oracle.request_batch(&[0, 0], &labels(2)).await.unwrap();
        let found = oracle.fulfillments(&[2, 3, 1]).await.unwrap();
        assert_eq!(found, vec![oracle.fulfillment(2), oracle.fulfillment(1)]);
    }

    #[tokio::test]
    async fn auto_fulfill_delivers_every_request() {
        let (tx, mut rx) = mpsc::channel(8);
        let oracle = FakeOracle::new().with_auto_fulfill(tx, Duration::from_millis(1));
        oracle.request_batch(&[3, 3], &labels(2)).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.request_id, second.request_id), (2, 1));
    }
}
