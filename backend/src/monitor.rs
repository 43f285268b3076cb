//! Refill monitor: keeps every category's inventory between its threshold
//! and its target.
//!
//! Triggered by a periodic tick and by every `acquire`. At most one refill
//! per category is in flight; triggers arriving meanwhile are coalesced into
//! it. The in-flight flag is held by an RAII guard, so it clears when the
//! batcher resolves, whatever the result.
//!
//! Each tick first asks the oracle about pending requests, so a fulfillment
//! whose notification was lost cannot keep a record pending (and counted as
//! stock) forever.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::allocation::{AllocationTable, Category};
use crate::batcher::{BatchOutcome, RequestBatcher};
use crate::correlator::{Correlation, FulfillmentCorrelator};
use crate::error::{PoolError, PoolResult};
use crate::events::{EventFeed, PoolEvent};
use crate::metrics::Metrics;
use crate::store::ProofStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefillOutcome {
    /// Active plus pending proofs meet the threshold.
    Satisfied,
    /// A refill for the category was already in flight.
    Coalesced,
    /// Below threshold, but no signer to issue requests with.
    SignerUnavailable,
    /// The batcher was invoked for `deficit` proofs.
    Requested { deficit: u32, outcome: BatchOutcome },
    Failed(PoolError),
}

/// What a nudge did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nudge {
    Started,
    Coalesced,
    NotNeeded,
}

type InFlight = Arc<Mutex<HashSet<Category>>>;

fn lock(set: &InFlight) -> MutexGuard<'_, HashSet<Category>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct InFlightGuard {
    set: InFlight,
    category: Category,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.category);
    }
}

pub struct RefillMonitor {
    store: Arc<ProofStore>,
    batcher: Arc<RequestBatcher>,
    allocations: Arc<AllocationTable>,
    in_flight: InFlight,
    correlator: FulfillmentCorrelator,
    retention: Option<chrono::Duration>,
    events: EventFeed,
    metrics: Arc<Metrics>,
}

impl RefillMonitor {
    pub fn new(
        store: Arc<ProofStore>,
        batcher: Arc<RequestBatcher>,
        allocations: Arc<AllocationTable>,
        events: EventFeed,
        metrics: Arc<Metrics>,
    ) -> Self {
        let correlator = FulfillmentCorrelator::new(store.clone(), events.clone(), metrics.clone());
        Self {
            store,
            batcher,
            allocations,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            correlator,
            retention: None,
            events,
            metrics,
        }
    }

    /// Prune consumed records older than `retention` on every run tick.
    pub fn with_retention(mut self, retention: Option<chrono::Duration>) -> Self {
        self.retention = retention;
        self
    }

    pub fn signer_available(&self) -> bool {
        self.batcher.signer_available()
    }

    pub fn is_in_flight(&self, category: &Category) -> bool {
        lock(&self.in_flight).contains(category)
    }

    /// Categories with a refill in flight, in batching order.
    pub fn in_flight(&self) -> Vec<Category> {
        let mut categories: Vec<Category> = lock(&self.in_flight).iter().cloned().collect();
        categories.sort();
        categories
    }

    fn try_claim(&self, category: &Category) -> Option<InFlightGuard> {
        let mut set = lock(&self.in_flight);
        if !set.insert(category.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.in_flight.clone(),
            category: category.clone(),
        })
    }

    /// Proofs needed to bring `category` back to target, or `None` while
    /// active plus pending stays at or above the threshold.
    pub async fn deficit(&self, category: &Category) -> PoolResult<Option<u32>> {
        let allocation = self.allocations.allocation_for(category)?;
        let in_stock = u32::try_from(self.store.counts(category).await.in_stock()).unwrap_or(u32::MAX);
        if in_stock >= allocation.refill_threshold {
            return Ok(None);
        }
        Ok(Some(allocation.target - in_stock))
    }

    /// Refill one category now, unless a refill for it is already running.
    pub async fn refill(&self, category: &Category) -> RefillOutcome {
        let Some(guard) = self.try_claim(category) else {
            self.metrics.record_coalesced();
            debug!(category = %category, "Refill already in flight");
            return RefillOutcome::Coalesced;
        };
        self.refill_claimed(category, guard).await
    }

    async fn refill_claimed(&self, category: &Category, _guard: InFlightGuard) -> RefillOutcome {
        let deficit = match self.deficit(category).await {
            Ok(Some(deficit)) => deficit,
            Ok(None) => return RefillOutcome::Satisfied,
            Err(e) => return RefillOutcome::Failed(e),
        };
        if !self.batcher.signer_available() {
            debug!(category = %category, deficit, "Refill skipped, signer unavailable");
            return RefillOutcome::SignerUnavailable;
        }

        self.announce(category, deficit);
        match self.batcher.request_proofs(category, deficit).await {
            Ok(outcome) => RefillOutcome::Requested { deficit, outcome },
            Err(PoolError::SignerUnavailable) => RefillOutcome::SignerUnavailable,
            Err(e) => RefillOutcome::Failed(e),
        }
    }

    fn announce(&self, category: &Category, deficit: u32) {
        self.metrics.record_refill();
        info!(category = %category, deficit, "Refill triggered");
        self.events.emit(PoolEvent::RefillTriggered {
            category: category.clone(),
            deficit,
        });
    }

    /// Start a background refill if the category needs one and none is
    /// running. Returns once the decision is made, not when the refill ends.
    ///
    /// Only a nudge that finds a deficit counts as coalesced.
    pub async fn nudge(self: &Arc<Self>, category: &Category) -> Nudge {
        if !matches!(self.deficit(category).await, Ok(Some(_))) {
            return Nudge::NotNeeded;
        }
        let Some(guard) = self.try_claim(category) else {
            self.metrics.record_coalesced();
            return Nudge::Coalesced;
        };

        let monitor = self.clone();
        let category = category.clone();
        tokio::spawn(async move {
            let outcome = monitor.refill_claimed(&category, guard).await;
            debug!(category = %category, outcome = ?outcome, "Nudged refill finished");
        });
        Nudge::Started
    }

    /// Apply fulfillments the oracle already holds for pending requests.
    /// Returns how many records were activated.
    pub async fn reconcile(&self) -> usize {
        let pending = self.store.pending_request_ids().await;
        if pending.is_empty() {
            return 0;
        }
        let found = match self.batcher.lookup_fulfillments(&pending).await {
            Ok(found) => found,
            Err(reason) => {
                warn!(pending = pending.len(), reason = %reason, "Fulfillment lookup failed");
                return 0;
            }
        };

        let mut activated = 0;
        for event in found {
            if let Correlation::Activated(_) = self.correlator.handle(event).await {
                activated += 1;
            }
        }
        if activated > 0 {
            info!(activated, pending = pending.len(), "Recovered fulfillments missed by the stream");
        }
        activated
    }

    /// Delete consumed records past the retention window, if one is set.
    pub async fn prune_expired(&self) -> PoolResult<usize> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let pruned = self.store.prune_consumed(Utc::now() - retention).await?;
        if pruned > 0 {
            info!(pruned, "Pruned consumed records past retention");
        }
        Ok(pruned)
    }

    /// Reconcile pending requests, then evaluate every configured category
    /// and refill those below threshold, in batching order.
    pub async fn tick(&self) -> Vec<(Category, RefillOutcome)> {
        self.reconcile().await;

        let mut results = Vec::new();
        let mut plan = Vec::new();
        let mut guards = Vec::new();

        for category in self.allocations.categories() {
            let Some(guard) = self.try_claim(category) else {
                self.metrics.record_coalesced();
                results.push((category.clone(), RefillOutcome::Coalesced));
                continue;
            };
            match self.deficit(category).await {
                Ok(Some(deficit)) => {
                    plan.push((category.clone(), deficit));
                    guards.push(guard);
                }
                Ok(None) => results.push((category.clone(), RefillOutcome::Satisfied)),
                Err(e) => results.push((category.clone(), RefillOutcome::Failed(e))),
            }
        }

        if plan.is_empty() {
            return results;
        }
        if !self.batcher.signer_available() {
            warn!(categories = plan.len(), "Refill tick skipped, signer unavailable");
            results.extend(
                plan.into_iter()
                    .map(|(c, _)| (c, RefillOutcome::SignerUnavailable)),
            );
            return results;
        }

        for (category, deficit) in &plan {
            self.announce(category, *deficit);
        }
        for ((category, result), (_, deficit)) in self.batcher.request_many(&plan).await.into_iter().zip(&plan) {
            let outcome = match result {
                Ok(outcome) => RefillOutcome::Requested {
                    deficit: *deficit,
                    outcome,
                },
                Err(PoolError::SignerUnavailable) => RefillOutcome::SignerUnavailable,
                Err(e) => RefillOutcome::Failed(e),
            };
            results.push((category, outcome));
        }
        drop(guards);
        results
    }

    /// Tick every `interval` until `shutdown` flips to true. A tick in
    /// progress runs to completion.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.prune_expired().await {
                        warn!(error = %e, "Retention prune failed");
                    }
                    for (category, outcome) in self.tick().await {
                        if let RefillOutcome::Requested { outcome, .. } = outcome {
                            if !outcome.is_complete() {
                                warn!(
                                    category = %category,
                                    unrequested = outcome.unrequested(),
                                    "Refill partially failed, retrying next tick"
                                );
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Refill monitor stopping");
                        return;
                    }
                }
            }
        }
    }
}
