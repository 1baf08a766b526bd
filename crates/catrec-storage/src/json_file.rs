use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use catrec_core::TargetRecord;
use tokio::fs;
use tracing::debug;

use crate::memory::{MemoryStore, StoredRecord};
use crate::reports::write_file_atomic;
use crate::store::{RecordStore, StoreError, TargetFilter};

/// A JSON array of [`StoredRecord`]s on disk.
///
/// Every successful write is persisted before the call returns, so a run
/// that stops halfway keeps the writes it already made.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: MemoryStore,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<StoredRecord> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        debug!(path = %path.display(), records = records.len(), "opened json record store");
        Ok(Self {
            path,
            records: MemoryStore::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Vec<StoredRecord> {
        self.records.snapshot().await
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let records = self.records.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&records)
            .context("serializing record store")
            .map_err(StoreError::Backend)?;
        write_file_atomic(&self.path, &bytes)
            .await
            .map_err(StoreError::Backend)
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn fetch_page(
        &self,
        filter: &TargetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TargetRecord>, StoreError> {
        self.records.fetch_page(filter, offset, limit).await
    }

    async fn apply(&self, id: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.records.apply(id, field, value).await?;
        self.persist().await
    }

    async fn insert(&self, payload: &BTreeMap<String, String>) -> Result<String, StoreError> {
        let id = self.records.insert(payload).await?;
        self.persist().await?;
        Ok(id)
    }

    async fn list_titles(&self) -> Result<Vec<String>, StoreError> {
        self.records.list_titles().await
    }
}
