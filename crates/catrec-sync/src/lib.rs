//! Reconciliation runs: configuration, the batch pipeline, reports and
//! catalog exports.

pub mod config;
pub mod export;
pub mod report;
pub mod runner;

use std::sync::Arc;

use anyhow::Context;
use catrec_storage::{JsonFileStore, PgStore, RecordStore};

pub use config::{ConfigError, PlannerSection, ReconConfig, SourceConfig, StoreConfig};
pub use export::{catalog_files, catalog_json, catalog_parquet, SnapshotManifest};
pub use report::{
    outcomes, plan_digest, recent_runs_markdown, render_brief, ActionRecord, ActionStatus,
    OutcomeRecord, RecordOutcome, RunMode, RunReport, RunTotals, StoredReport,
};
pub use runner::{BatchRunner, CancelToken, CatalogExport, LiveOptions, RunError, RunSummary};

pub const CRATE_NAME: &str = "catrec-sync";

/// Opens the store named by `config.store`.
pub async fn open_store(config: &ReconConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
    match &config.store {
        StoreConfig::Json { path } => {
            let store = JsonFileStore::open(path).await?;
            Ok(Arc::new(store))
        }
        StoreConfig::Postgres { url, layout } => {
            let url = url.as_deref().ok_or(ConfigError::MissingDatabaseUrl)?;
            let store = PgStore::connect(url, layout.clone(), config.store_timeout())
                .await
                .context("connecting to postgres target store")?;
            Ok(Arc::new(store))
        }
    }
}
