//! Persistence collaborator for the inventory store.

use async_trait::async_trait;
use uuid::Uuid;

use crate::allocation::GameFamily;
use crate::error::PoolResult;
use crate::record::ProofRecord;

/// Durable key-value storage for proof records, keyed by record id.
///
/// Each call must be atomic for the record it touches. The inventory store
/// serializes all calls, so implementations need no cross-record locking.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    async fn get(&self, id: &Uuid) -> PoolResult<Option<ProofRecord>>;

    /// Insert or overwrite a record.
    async fn put(&self, record: &ProofRecord) -> PoolResult<()>;

    async fn delete(&self, id: &Uuid) -> PoolResult<()>;

    async fn list_by_category(&self, family: GameFamily) -> PoolResult<Vec<ProofRecord>>;

    async fn list_all(&self) -> PoolResult<Vec<ProofRecord>>;
}
