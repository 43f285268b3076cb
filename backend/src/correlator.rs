//! Fulfillment correlator: applies oracle notifications to the store.
//!
//! Notifications are delivered at least once and in any order. Redeliveries
//! are silent no-ops; notifications for requests this instance never issued
//! are logged and dropped.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::events::{EventFeed, PoolEvent};
use crate::metrics::Metrics;
use crate::record::{ProofRecord, RandomValue, RequestId};
use crate::store::{Fulfillment, ProofStore};

/// One `(request_id, random_value)` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentEvent {
    pub request_id: RequestId,
    pub random_value: RandomValue,
}

/// What handling a notification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    Activated(ProofRecord),
    Duplicate,
    Unknown,
    Failed(PoolError),
}

pub struct FulfillmentCorrelator {
    store: Arc<ProofStore>,
    events: EventFeed,
    metrics: Arc<Metrics>,
}

impl FulfillmentCorrelator {
    pub fn new(store: Arc<ProofStore>, events: EventFeed, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            events,
            metrics,
        }
    }

    pub async fn handle(&self, event: FulfillmentEvent) -> Correlation {
        match self
            .store
            .mark_fulfilled(event.request_id, event.random_value)
            .await
        {
            Ok(Fulfillment::Activated(record)) => {
                self.metrics
                    .record_fulfillment(record.fulfillment_latency_ms());
                info!(
                    request_id = record.request_id,
                    category = %record.category(),
                    label = %record.label,
                    "Proof fulfilled"
                );
                self.events.emit(PoolEvent::RecordFulfilled {
                    id: record.id,
                    category: record.category(),
                    request_id: record.request_id,
                });
                Correlation::Activated(record)
            }
            Ok(Fulfillment::AlreadyApplied) => {
                self.metrics.record_duplicate_fulfillment();
                debug!(request_id = event.request_id, "Duplicate fulfillment ignored");
                Correlation::Duplicate
            }
            Err(PoolError::UnknownRequestId(request_id)) => {
                self.metrics.record_unknown_fulfillment();
                warn!(request_id, "Fulfillment for untracked request, ignoring");
                Correlation::Unknown
            }
            Err(e) => {
                error!(request_id = event.request_id, error = %e, "Failed to apply fulfillment");
                Correlation::Failed(e)
            }
        }
    }

    /// Apply notifications until the channel closes.
    pub async fn run(self, mut rx: mpsc::Receiver<FulfillmentEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        info!("Fulfillment channel closed, stopping correlator");
    }
}
