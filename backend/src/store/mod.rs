//! Proof inventory store: the single source of truth for record state.
//!
//! All operations run under one async mutex and persist to the
//! [`RecordBackend`] before committing to memory, so the in-memory view never
//! runs ahead of what is durable. Oracle calls never happen under this lock;
//! the batcher writes records only once a call's receipt is known.

mod backend;
mod json_file;
mod memory;

pub use backend::RecordBackend;
pub use json_file::JsonFileBackend;
pub use memory::MemoryBackend;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocation::{Category, GameFamily};
use crate::error::{PoolError, PoolResult};
use crate::record::{ProofRecord, ProofState, RandomValue, RequestId};

/// Records grouped by family, the on-disk and export layout.
pub type Snapshot = BTreeMap<GameFamily, Vec<ProofRecord>>;

pub(crate) fn group_by_family<'a>(records: impl IntoIterator<Item = &'a ProofRecord>) -> Snapshot {
    let mut snapshot: Snapshot = GameFamily::ALL.into_iter().map(|f| (f, Vec::new())).collect();
    for record in records {
        snapshot.entry(record.family).or_default().push(record.clone());
    }
    for list in snapshot.values_mut() {
        list.sort_by(|a, b| (a.requested_at, a.id).cmp(&(b.requested_at, b.id)));
    }
    snapshot
}

/// Result of applying a fulfillment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fulfillment {
    /// A pending record became active.
    Activated(ProofRecord),
    /// The record was already active or consumed; nothing changed.
    AlreadyApplied,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub pending: usize,
    pub active: usize,
    pub consumed: usize,
}

impl CategoryCounts {
    /// Proofs that are usable now or will be once fulfilled.
    pub fn in_stock(&self) -> usize {
        self.pending + self.active
    }

    pub fn total(&self) -> usize {
        self.pending + self.active + self.consumed
    }
}

#[derive(Default)]
struct Inventory {
    records: HashMap<Uuid, ProofRecord>,
    by_request: HashMap<RequestId, Uuid>,
    /// Active record ids per family, oldest fulfillment first.
    active: HashMap<GameFamily, VecDeque<Uuid>>,
}

impl Inventory {
    fn from_records(records: Vec<ProofRecord>) -> Self {
        let mut inv = Self::default();
        let mut sorted = records;
        sorted.sort_by(|a, b| (a.requested_at, a.id).cmp(&(b.requested_at, b.id)));

        for record in sorted {
            inv.index_request(&record);
            inv.records.insert(record.id, record);
        }
        inv.rebuild_active();
        inv
    }

    /// Point the request id at this record unless a live record holds it.
    fn index_request(&mut self, record: &ProofRecord) {
        if record.state == ProofState::Consumed && self.live_holder(record.request_id).is_some() {
            return;
        }
        self.by_request.insert(record.request_id, record.id);
    }

    fn live_holder(&self, request_id: RequestId) -> Option<&ProofRecord> {
        self.by_request
            .get(&request_id)
            .and_then(|id| self.records.get(id))
            .filter(|r| r.state != ProofState::Consumed)
    }

    fn rebuild_active(&mut self) {
        let mut active: Vec<&ProofRecord> = self
            .records
            .values()
            .filter(|r| r.state == ProofState::Active)
            .collect();
        active.sort_by(|a, b| (a.fulfilled_at, a.id).cmp(&(b.fulfilled_at, b.id)));

        self.active.clear();
        for record in active {
            self.active
                .entry(record.family)
                .or_default()
                .push_back(record.id);
        }
    }

    fn counts(&self, category: &Category) -> CategoryCounts {
        let mut counts = CategoryCounts::default();
        for record in self.records.values().filter(|r| category.matches(r)) {
            match record.state {
                ProofState::Pending => counts.pending += 1,
                ProofState::Active => counts.active += 1,
                ProofState::Consumed => counts.consumed += 1,
            }
        }
        counts
    }
}

pub struct ProofStore {
    backend: Arc<dyn RecordBackend>,
    inner: Mutex<Inventory>,
}

impl ProofStore {
    /// Load every record from `backend` and rebuild the indexes.
    pub async fn open(backend: Arc<dyn RecordBackend>) -> PoolResult<Self> {
        let records = backend.list_all().await?;
        let inventory = Inventory::from_records(records);
        info!(
            records = inventory.records.len(),
            active = inventory.active.values().map(VecDeque::len).sum::<usize>(),
            "Opened proof store"
        );
        Ok(Self {
            backend,
            inner: Mutex::new(inventory),
        })
    }

    /// Insert a new pending record.
    pub async fn put(&self, record: ProofRecord) -> PoolResult<()> {
        if record.state != ProofState::Pending || !record.is_consistent() {
            return Err(PoolError::InvalidTransition {
                from: record.state,
                to: ProofState::Pending,
            });
        }

        let mut inv = self.inner.lock().await;
        if inv.live_holder(record.request_id).is_some() {
            return Err(PoolError::DuplicateRequestId(record.request_id));
        }

        self.backend.put(&record).await?;
        inv.by_request.insert(record.request_id, record.id);
        inv.records.insert(record.id, record);
        Ok(())
    }

    /// Activate the pending record carrying `request_id`.
    ///
    /// Redelivery for a record that is already active or consumed is a no-op.
    pub async fn mark_fulfilled(
        &self,
        request_id: RequestId,
        value: RandomValue,
    ) -> PoolResult<Fulfillment> {
        let mut inv = self.inner.lock().await;
        let Some(current) = inv
            .by_request
            .get(&request_id)
            .and_then(|id| inv.records.get(id))
        else {
            return Err(PoolError::UnknownRequestId(request_id));
        };

        if current.state != ProofState::Pending {
            if current.random_value != Some(value) {
                warn!(
                    request_id,
                    record = %current.id,
                    "Redelivered fulfillment carries a different value, keeping the first"
                );
            }
            return Ok(Fulfillment::AlreadyApplied);
        }

        let mut updated = current.clone();
        updated.fulfill(value, Utc::now())?;
        self.backend.put(&updated).await?;

        inv.active
            .entry(updated.family)
            .or_default()
            .push_back(updated.id);
        inv.records.insert(updated.id, updated.clone());
        Ok(Fulfillment::Activated(updated))
    }

    /// Consume the oldest active record of the family, optionally restricted
    /// to one sub-variant.
    pub async fn take_one(
        &self,
        family: GameFamily,
        sub_variant: Option<&str>,
    ) -> PoolResult<ProofRecord> {
        let category = Category {
            family,
            variant: sub_variant.map(str::to_string),
        };

        let mut inv = self.inner.lock().await;
        let position = inv.active.get(&family).and_then(|queue| {
            queue
                .iter()
                .position(|id| inv.records.get(id).is_some_and(|r| category.matches(r)))
        });
        let Some(position) = position else {
            return Err(PoolError::Exhausted(category));
        };

        let id = inv.active[&family][position];
        let mut updated = inv.records[&id].clone();
        updated.consume(Utc::now())?;
        self.backend.put(&updated).await?;

        if let Some(queue) = inv.active.get_mut(&family) {
            queue.remove(position);
        }
        inv.records.insert(id, updated.clone());
        Ok(updated)
    }

    pub async fn counts(&self, category: &Category) -> CategoryCounts {
        self.inner.lock().await.counts(category)
    }

    pub async fn count_active(&self, category: &Category) -> usize {
        self.counts(category).await.active
    }

    pub async fn count_pending(&self, category: &Category) -> usize {
        self.counts(category).await.pending
    }

    pub async fn count_consumed(&self, category: &Category) -> usize {
        self.counts(category).await.consumed
    }

    pub async fn get(&self, id: &Uuid) -> Option<ProofRecord> {
        self.inner.lock().await.records.get(id).cloned()
    }

    /// Records of a category, oldest request first.
    pub async fn records(&self, category: &Category) -> Vec<ProofRecord> {
        let inv = self.inner.lock().await;
        let mut records: Vec<ProofRecord> = inv
            .records
            .values()
            .filter(|r| category.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| (a.requested_at, a.id).cmp(&(b.requested_at, b.id)));
        records
    }

    /// Request ids still waiting for fulfillment.
    pub async fn pending_request_ids(&self) -> Vec<RequestId> {
        let inv = self.inner.lock().await;
        let mut ids: Vec<RequestId> = inv
            .records
            .values()
            .filter(|r| r.state == ProofState::Pending)
            .map(|r| r.request_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Delete consumed records consumed before `before`. Returns the number
    /// removed.
    pub async fn prune_consumed(&self, before: DateTime<Utc>) -> PoolResult<usize> {
        let mut inv = self.inner.lock().await;
        let expired: Vec<(Uuid, RequestId)> = inv
            .records
            .values()
            .filter(|r| r.state == ProofState::Consumed && r.consumed_at.is_some_and(|t| t < before))
            .map(|r| (r.id, r.request_id))
            .collect();

        for (id, request_id) in &expired {
            self.backend.delete(id).await?;
            inv.records.remove(id);
            if inv.by_request.get(request_id) == Some(id) {
                inv.by_request.remove(request_id);
            }
        }
        Ok(expired.len())
    }

    /// Pretty JSON backup of every record, grouped by family.
    pub async fn export_json(&self) -> PoolResult<String> {
        let inv = self.inner.lock().await;
        serde_json::to_string_pretty(&group_by_family(inv.records.values()))
            .map_err(PoolError::storage)
    }

    /// Merge a backup produced by [`export_json`](Self::export_json).
    ///
    /// Records whose id is already known are skipped, as are inconsistent
    /// records and live records whose request id is held by a live record.
    /// Returns the number of records imported.
    pub async fn import_json(&self, doc: &str) -> PoolResult<usize> {
        let snapshot: Snapshot = serde_json::from_str(doc)
            .map_err(|e| PoolError::Storage(format!("invalid backup: {e}")))?;

        let mut inv = self.inner.lock().await;
        let mut imported = 0;
        for record in snapshot.into_values().flatten() {
            if inv.records.contains_key(&record.id) {
                continue;
            }
            if !record.is_consistent() {
                warn!(record = %record.id, state = %record.state, "Skipping inconsistent record in backup");
                continue;
            }
            if record.state != ProofState::Consumed && inv.live_holder(record.request_id).is_some() {
                warn!(
                    record = %record.id,
                    request_id = record.request_id,
                    "Skipping backup record with a live duplicate request id"
                );
                continue;
            }

            self.backend.put(&record).await?;
            inv.index_request(&record);
            inv.records.insert(record.id, record);
            imported += 1;
        }

        if imported > 0 {
            inv.rebuild_active();
        }
        Ok(imported)
    }
}
