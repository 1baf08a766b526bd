use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catrec_core::TargetRecord;
use thiserror::Error;

/// Selects which target records a page query returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFilter {
    /// Field whose current value is reported as `existing_value`.
    pub field: String,
    /// Only records whose `field` is missing or blank.
    pub missing_only: bool,
}

impl TargetFilter {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            missing_only: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("record {0} not found")]
    NotFound(String),
    #[error("record {id} already holds a different value for '{field}'")]
    Conflict { id: String, field: String },
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// The narrow interface the engine needs from a target store.
///
/// `apply` only fills gaps: writing to a populated field fails with
/// [`StoreError::Conflict`] unless the stored value already equals `value`,
/// which makes a repeated apply harmless.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch_page(
        &self,
        filter: &TargetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TargetRecord>, StoreError>;

    async fn apply(&self, id: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Creates a record from a planner payload and returns its id.
    async fn insert(&self, payload: &BTreeMap<String, String>) -> Result<String, StoreError>;

    /// Titles of every existing record, used for insert existence checks.
    async fn list_titles(&self) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn fetch_page(
        &self,
        filter: &TargetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TargetRecord>, StoreError> {
        (**self).fetch_page(filter, offset, limit).await
    }

    async fn apply(&self, id: &str, field: &str, value: &str) -> Result<(), StoreError> {
        (**self).apply(id, field, value).await
    }

    async fn insert(&self, payload: &BTreeMap<String, String>) -> Result<String, StoreError> {
        (**self).insert(payload).await
    }

    async fn list_titles(&self) -> Result<Vec<String>, StoreError> {
        (**self).list_titles().await
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, at most 63 chars: safe to splice into SQL.
pub fn is_safe_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    ident.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
