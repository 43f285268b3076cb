//! In-memory record backend, for tests and throwaway runs.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::RecordBackend;
use crate::allocation::GameFamily;
use crate::error::PoolResult;
use crate::record::ProofRecord;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<Uuid, ProofRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn get(&self, id: &Uuid) -> PoolResult<Option<ProofRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(&self, record: &ProofRecord) -> PoolResult<()> {
        self.records
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> PoolResult<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn list_by_category(&self, family: GameFamily) -> PoolResult<Vec<ProofRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.family == family)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> PoolResult<Vec<ProofRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
