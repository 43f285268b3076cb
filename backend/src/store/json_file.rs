//! Record backend persisted as a single JSON document.
//!
//! The document groups records by family:
//!
//! ```json
//! { "MINES": [ { "id": "...", "state": "active", ... } ], "WHEEL": [] }
//! ```
//!
//! Every write rewrites the document to `<path>.tmp` and renames it over the
//! original, so a crash leaves either the old or the new document.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{RecordBackend, Snapshot, group_by_family};
use crate::allocation::GameFamily;
use crate::error::{PoolError, PoolResult};
use crate::record::ProofRecord;

pub struct JsonFileBackend {
    path: PathBuf,
    records: Mutex<HashMap<Uuid, ProofRecord>>,
}

impl JsonFileBackend {
    /// Open the document at `path`, creating parent directories. A missing
    /// file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> PoolResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(PoolError::storage)?;
        }

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let doc: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                    PoolError::Storage(format!("corrupt store {}: {e}", path.display()))
                })?;
                doc.into_values()
                    .flatten()
                    .map(|r| (r.id, r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(PoolError::storage(e)),
        };

        debug!(path = %path.display(), records = records.len(), "Opened JSON store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, records: &HashMap<Uuid, ProofRecord>) -> PoolResult<()> {
        let doc = group_by_family(records.values());
        let bytes = serde_json::to_vec_pretty(&doc).map_err(PoolError::storage)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(PoolError::storage)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(PoolError::storage)
    }
}

#[async_trait]
impl RecordBackend for JsonFileBackend {
    async fn get(&self, id: &Uuid) -> PoolResult<Option<ProofRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn put(&self, record: &ProofRecord) -> PoolResult<()> {
        let mut records = self.records.lock().await;
        let previous = records.insert(record.id, record.clone());
        if let Err(e) = self.flush(&records).await {
            // Keep memory in step with what is on disk.
            match previous {
                Some(prev) => records.insert(prev.id, prev),
                None => records.remove(&record.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> PoolResult<()> {
        let mut records = self.records.lock().await;
        let Some(previous) = records.remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.flush(&records).await {
            records.insert(previous.id, previous);
            return Err(e);
        }
        Ok(())
    }

    async fn list_by_category(&self, family: GameFamily) -> PoolResult<Vec<ProofRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.family == family)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> PoolResult<Vec<ProofRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}
