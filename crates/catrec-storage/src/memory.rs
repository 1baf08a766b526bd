use std::collections::BTreeMap;

use async_trait::async_trait;
use catrec_core::TargetRecord;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::store::{RecordStore, StoreError, TargetFilter};

/// A record as kept by the in-process stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl StoredRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    fn value_of(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Ordered in-memory store. Pages follow insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredRecord>>,
}

impl MemoryStore {
    pub fn new(records: Vec<StoredRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub async fn snapshot(&self) -> Vec<StoredRecord> {
        self.records.lock().await.clone()
    }

    fn next_id(records: &[StoredRecord]) -> String {
        let mut n = records.len() + 1;
        loop {
            let candidate = format!("new-{n}");
            if !records.iter().any(|r| r.id == candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_page(
        &self,
        filter: &TargetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TargetRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| !filter.missing_only || r.value_of(&filter.field).is_none())
            .skip(offset)
            .take(limit)
            .map(|r| TargetRecord {
                id: r.id.clone(),
                title: r.title.clone(),
                existing_value: r.fields.get(&filter.field).cloned(),
            })
            .collect())
    }

    async fn apply(&self, id: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        match record.value_of(field) {
            Some(current) if current == value => Ok(()),
            Some(_) => Err(StoreError::Conflict {
                id: id.to_string(),
                field: field.to_string(),
            }),
            None => {
                record.fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    async fn insert(&self, payload: &BTreeMap<String, String>) -> Result<String, StoreError> {
        let title = payload
            .get("title")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| StoreError::Rejected("insert payload has no title".to_string()))?;
        let mut records = self.records.lock().await;
        let id = Self::next_id(&records);
        let fields = payload
            .iter()
            .filter(|(k, _)| k.as_str() != "title")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        records.push(StoredRecord {
            id: id.clone(),
            title: title.clone(),
            fields,
        });
        Ok(id)
    }

    async fn list_titles(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .map(|r| r.title.clone())
            .collect())
    }
}
