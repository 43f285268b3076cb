//! The pool facade: the only surface game logic talks to.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::allocation::{AllocationTable, Category};
use crate::batcher::RequestBatcher;
use crate::config::PoolSettings;
use crate::correlator::FulfillmentCorrelator;
use crate::error::{PoolError, PoolResult};
use crate::events::{EventFeed, PoolEvent};
use crate::metrics::Metrics;
use crate::monitor::RefillMonitor;
use crate::oracle::{Oracle, SignerStatus};
use crate::record::ProofRecord;
use crate::store::{CategoryCounts, ProofStore};

/// Per-category inventory counts plus totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub categories: BTreeMap<String, CategoryCounts>,
    pub total_pending: usize,
    pub total_active: usize,
    pub total_consumed: usize,
}

pub struct ProofPool {
    store: Arc<ProofStore>,
    monitor: Arc<RefillMonitor>,
    allocations: Arc<AllocationTable>,
    events: EventFeed,
    metrics: Arc<Metrics>,
}

impl ProofPool {
    /// Wire the batcher, monitor and facade around an opened store.
    pub fn new(
        oracle: Arc<dyn Oracle>,
        signer: Arc<dyn SignerStatus>,
        store: Arc<ProofStore>,
        allocations: AllocationTable,
        settings: PoolSettings,
    ) -> Self {
        let allocations = Arc::new(allocations);
        let retention = settings.retention;
        let events = EventFeed::new();
        let metrics = Arc::new(Metrics::new());
        let batcher = Arc::new(RequestBatcher::new(
            oracle,
            signer,
            store.clone(),
            allocations.clone(),
            settings,
            events.clone(),
            metrics.clone(),
        ));
        let monitor = Arc::new(
            RefillMonitor::new(
                store.clone(),
                batcher,
                allocations.clone(),
                events.clone(),
                metrics.clone(),
            )
            .with_retention(retention),
        );
        Self {
            store,
            monitor,
            allocations,
            events,
            metrics,
        }
    }

    /// Take one proof for `category`.
    ///
    /// Every take nudges the refill monitor. When nothing is active the
    /// caller gets [`PoolError::Exhausted`] and should retry shortly, or
    /// [`PoolError::SignerUnavailable`] if no refill can be issued at all.
    pub async fn acquire(&self, category: &Category) -> PoolResult<ProofRecord> {
        self.allocations.allocation_for(category)?;

        match self
            .store
            .take_one(category.family, category.variant.as_deref())
            .await
        {
            Ok(record) => {
                self.metrics.record_consumed();
                info!(
                    category = %category,
                    request_id = record.request_id,
                    label = %record.label,
                    "Proof consumed"
                );
                self.events.emit(PoolEvent::RecordConsumed {
                    id: record.id,
                    category: record.category(),
                    request_id: record.request_id,
                });
                self.monitor.nudge(category).await;
                Ok(record)
            }
            Err(PoolError::Exhausted(exhausted)) => {
                self.metrics.record_exhaustion();
                if !self.monitor.signer_available() {
                    warn!(category = %category, "Pool exhausted and signer unavailable");
                    return Err(PoolError::SignerUnavailable);
                }
                warn!(category = %category, "Pool exhausted");
                self.monitor.nudge(category).await;
                Err(PoolError::Exhausted(exhausted))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for category in self.allocations.categories() {
            let counts = self.store.counts(category).await;
            stats.total_pending += counts.pending;
            stats.total_active += counts.active;
            stats.total_consumed += counts.consumed;
            stats.categories.insert(category.to_string(), counts);
        }
        stats
    }

    /// Whether the category sits below its refill threshold.
    pub async fn needs_refill(&self, category: &Category) -> PoolResult<bool> {
        Ok(self.monitor.deficit(category).await?.is_some())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// A correlator applying fulfillments to this pool's store.
    pub fn correlator(&self) -> FulfillmentCorrelator {
        FulfillmentCorrelator::new(self.store.clone(), self.events.clone(), self.metrics.clone())
    }

    pub fn monitor(&self) -> &Arc<RefillMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<ProofStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::GameFamily;
    use crate::oracle::fake::FakeOracle;
    use crate::record::ProofState;
    use crate::store::MemoryBackend;
    use std::time::Duration;

    async fn pool(table: &str) -> (ProofPool, Arc<FakeOracle>) {
        let oracle = Arc::new(FakeOracle::new());
        let store = Arc::new(ProofStore::open(Arc::new(MemoryBackend::new())).await.unwrap());
        let settings = PoolSettings {
            batch_cooldown: Duration::ZERO,
            ..PoolSettings::default()
        };
        let pool = ProofPool::new(
            oracle.clone(),
            oracle.clone(),
            store,
            AllocationTable::parse(table).unwrap(),
            settings,
        );
        (pool, oracle)
    }

    #[tokio::test]
    async fn unknown_category_is_rejected() {
        let (pool, _) = pool("MINES=50:25").await;
        let err = pool
            .acquire(&Category::family(GameFamily::Roulette))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::UnknownCategory("roulette".into()));
    }

    #[tokio::test]
    async fn exhausted_without_signer_reports_signer() {
        let (pool, oracle) = pool("MINES=50:25").await;
        oracle.set_signer_available(false);
        assert_eq!(
            pool.acquire(&Category::family(GameFamily::Mines)).await,
            Err(PoolError::SignerUnavailable)
        );
        assert!(oracle.call_sizes().is_empty());
    }

    #[tokio::test]
    async fn acquire_returns_fulfilled_proof_and_reports_it() {
        let (pool, oracle) = pool("PLINKO=4:2").await;
        let plinko = Category::family(GameFamily::Plinko);
        let mut feed = pool.subscribe();

        pool.monitor().refill(&plinko).await;
        let correlator = pool.correlator();
        for event in oracle.drain_fulfillments() {
            correlator.handle(event).await;
        }

        let record = pool.acquire(&plinko).await.unwrap();
        assert_eq!(record.state, ProofState::Consumed);
        assert!(record.random_value.is_some());

        let stats = pool.stats().await;
        assert_eq!(
            stats.categories["plinko"],
            CategoryCounts {
                pending: 0,
                active: 3,
                consumed: 1
            }
        );
        assert_eq!(stats.total_active, 3);
        assert!(!pool.needs_refill(&plinko).await.unwrap());

        let mut consumed = 0;
        while let Ok(event) = feed.try_recv() {
            if matches!(event, PoolEvent::RecordConsumed { .. }) {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 1);
    }
}
