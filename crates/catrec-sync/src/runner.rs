use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use catrec_adapters::{parse_listing, ListingError, SkippedRecord};
use catrec_core::{
    normalize, ActionType, CatalogEntry, CatalogMatcher, DuplicateDetector, DuplicatePair,
    MatchResult, ReconciliationAction, ReconciliationPlanner, TargetRecord,
};
use catrec_storage::{
    FetchError, HttpClientConfig, HttpFetcher, RecordStore, ReportFile, ReportStore,
    RetryingStore, StoreError, TargetFilter,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::{ConfigError, ReconConfig};
use crate::export::catalog_files;
use crate::report::{
    outcomes, plan_digest, render_brief, ActionKey, ActionRecord, ActionStatus, RunMode,
    RunReport, RunTotals, StoredReport, BRIEF_MD, REPORT_JSON, REPORT_SCHEMA_VERSION,
};

pub const DUPLICATES_JSON: &str = "duplicates.json";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("run cancelled before completion")]
    Cancelled,
    #[error("{unapproved} planned action(s) are missing from approved report {approved_run}")]
    NotApproved {
        approved_run: String,
        unapproved: usize,
    },
    #[error("report {run_id} is a {mode} report; approval needs a dry run")]
    ApprovalNotDryRun { run_id: String, mode: RunMode },
    #[error("report {run_id} reconciles '{approved}', this run reconciles '{configured}'")]
    FieldMismatch {
        run_id: String,
        approved: String,
        configured: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unreadable source listing: {0}")]
    Listing(#[from] ListingError),
    #[error("fetching source listing: {0}")]
    Fetch(#[from] FetchError),
    #[error("target store: {0}")]
    Store(#[from] StoreError),
    #[error("matcher worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Shared stop flag. The runner looks at it between store pages and once
/// more before any live write; a page in flight is always finished.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a live run needs besides the config.
#[derive(Debug, Clone)]
pub struct LiveOptions {
    /// The dry-run report an operator reviewed.
    pub approved: StoredReport,
    /// An earlier live report whose applied work is not repeated.
    pub resume_from: Option<StoredReport>,
}

impl LiveOptions {
    pub fn new(approved: StoredReport) -> Self {
        Self {
            approved,
            resume_from: None,
        }
    }

    pub fn resuming(mut self, previous: StoredReport) -> Self {
        self.resume_from = Some(previous);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan_digest: String,
    pub totals: RunTotals,
    pub report_dir: PathBuf,
    /// A report with the same run id already existed and was swapped out.
    pub replaced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogExport {
    pub export_id: String,
    pub dir: PathBuf,
    pub entries: usize,
    pub duplicates: usize,
    pub parse_errors: usize,
}

struct LoadedCatalog {
    listing_sha256: Vec<u8>,
    entries: Arc<Vec<CatalogEntry>>,
    duplicates: Vec<DuplicatePair>,
    skipped: Vec<SkippedRecord>,
}

/// One reconciliation run from listing to committed report.
///
/// Dry run is the default entry point; [`BatchRunner::live_run`] only writes
/// actions that appear in an approved dry-run report.
pub struct BatchRunner<S> {
    config: ReconConfig,
    store: RetryingStore<S>,
    reports: ReportStore,
    fetcher: Option<HttpFetcher>,
}

impl<S: RecordStore> BatchRunner<S> {
    pub fn new(config: ReconConfig, store: S) -> Result<Self, RunError> {
        config.validate()?;
        let fetcher = match &config.source.url {
            Some(_) => Some(HttpFetcher::new(HttpClientConfig {
                timeout: std::time::Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                backoff: config.backoff(),
            })?),
            None => None,
        };
        let store = RetryingStore::new(store, config.store_timeout(), config.backoff());
        let reports = ReportStore::new(config.reports_dir.clone());
        Ok(Self {
            config,
            store,
            reports,
            fetcher,
        })
    }

    pub async fn dry_run(&self, cancel: &CancelToken) -> Result<RunSummary, RunError> {
        self.run(RunMode::DryRun, None, cancel).await
    }

    pub async fn live_run(
        &self,
        options: &LiveOptions,
        cancel: &CancelToken,
    ) -> Result<RunSummary, RunError> {
        self.run(RunMode::Live, Some(options), cancel).await
    }

    /// Parses and deduplicates the listing and commits only the catalog
    /// export. The target store is not touched.
    pub async fn export_catalog(&self) -> Result<CatalogExport, RunError> {
        let catalog = self.load_catalog().await?;

        let mut hasher = Sha256::new();
        hasher.update(&catalog.listing_sha256);
        hasher.update(serde_json::to_vec(&self.config.fingerprint()).context("hashing config")?);
        let export_id = format!("catalog-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, &hasher.finalize()));

        let mut files = catalog_files(&catalog.entries)?;
        let duplicates =
            serde_json::to_vec_pretty(&catalog.duplicates).context("serializing duplicates")?;
        files.push(ReportFile::new(DUPLICATES_JSON, duplicates));
        let committed = self.reports.commit(&export_id, &files).await?;

        info!(
            export_id = %export_id,
            entries = catalog.entries.len(),
            duplicates = catalog.duplicates.len(),
            "catalog export committed"
        );
        Ok(CatalogExport {
            export_id,
            dir: committed.dir,
            entries: catalog.entries.len(),
            duplicates: catalog.duplicates.len(),
            parse_errors: catalog.skipped.len(),
        })
    }

    async fn run(
        &self,
        mode: RunMode,
        live: Option<&LiveOptions>,
        cancel: &CancelToken,
    ) -> Result<RunSummary, RunError> {
        let span = info_span!("recon_run", %mode, run_id = tracing::field::Empty);
        self.run_inner(mode, live, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        mode: RunMode,
        live: Option<&LiveOptions>,
        cancel: &CancelToken,
    ) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let approved = match live {
            Some(options) => Some(self.approved_keys(&options.approved)?),
            None => None,
        };
        let resume = live.and_then(|o| o.resume_from.as_ref());

        let catalog = self.load_catalog().await?;
        let (targets, results) = self.match_targets(&catalog.entries, cancel).await?;

        let titles = self.store.list_titles().await?;
        let mut known_titles: BTreeSet<String> = titles
            .iter()
            .map(|title| normalize(title))
            .filter(|title| !title.is_empty())
            .collect();
        let mut existing: BTreeSet<String> = targets
            .iter()
            .filter(|t| t.has_value())
            .map(|t| t.id.clone())
            .collect();
        if let Some(previous) = resume {
            existing.extend(previous.applied_targets());
            known_titles.extend(previous.inserted_titles());
        }

        let planner = ReconciliationPlanner::new(self.config.planner_config());
        let mut actions = planner.plan(&results, &existing);
        if self.config.missing_only && self.config.planner.insert_unmatched {
            let mut linking = results.clone();
            linking.extend(self.title_links(&catalog.entries, &titles).await?);
            actions.extend(planner.plan_inserts(&catalog.entries, &linking, &known_titles));
        } else {
            actions.extend(planner.plan_inserts(&catalog.entries, &results, &known_titles));
        }
        let digest = plan_digest(&actions)?;
        let run_id = self.run_id(&catalog.listing_sha256, &targets, &titles, mode, resume)?;
        Span::current().record("run_id", run_id.as_str());
        info!(
            targets = targets.len(),
            actions = actions.len(),
            plan_digest = %digest,
            "plan ready"
        );

        if cancel.is_cancelled() {
            info!("run cancelled before report commit");
            return Err(RunError::Cancelled);
        }

        let records = match (mode, &approved) {
            (RunMode::Live, Some(approved)) => {
                self.check_approved(&actions, approved, live)?;
                self.apply_actions(actions).await
            }
            _ => actions.into_iter().map(ActionRecord::proposed).collect(),
        };

        let report = RunReport {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id: run_id.clone(),
            mode,
            field: self.config.field.clone(),
            plan_digest: digest.clone(),
            totals: RunTotals::tally(
                &results,
                &records,
                catalog.duplicates.len(),
                catalog.skipped.len(),
            ),
            outcomes: outcomes(&results, &records),
            duplicates: catalog.duplicates,
            parse_errors: catalog.skipped,
            matches: results,
            actions: records,
        };

        let mut files = vec![
            ReportFile::new(REPORT_JSON, report.to_json()?),
            ReportFile::new(BRIEF_MD, render_brief(&report)),
        ];
        files.extend(catalog_files(&catalog.entries)?);
        let committed = self.reports.commit(&run_id, &files).await?;

        let finished_at = Utc::now();
        info!(
            processed = report.totals.processed,
            matched = report.totals.matched,
            updated = report.totals.updated,
            failed = report.totals.failed,
            replaced = committed.replaced,
            "run report committed"
        );
        Ok(RunSummary {
            run_id,
            mode,
            started_at,
            finished_at,
            plan_digest: digest,
            totals: report.totals,
            report_dir: committed.dir,
            replaced: committed.replaced,
        })
    }

    async fn load_catalog(&self) -> Result<LoadedCatalog, RunError> {
        let bytes = self.listing_bytes().await?;
        let listing_sha256 = Sha256::digest(&bytes).to_vec();
        let text = String::from_utf8_lossy(&bytes);
        let parsed = parse_listing(&text, &self.config.source.listing)?;
        let (entries, duplicates) = DuplicateDetector::new(self.config.dedup).apply(parsed.entries);
        info!(
            entries = entries.len(),
            duplicates = duplicates.len(),
            skipped = parsed.skipped.len(),
            "catalog loaded"
        );
        Ok(LoadedCatalog {
            listing_sha256,
            entries: Arc::new(entries),
            duplicates,
            skipped: parsed.skipped,
        })
    }

    async fn listing_bytes(&self) -> Result<Vec<u8>, RunError> {
        let source = &self.config.source;
        match (&source.path, &source.url, &self.fetcher) {
            (Some(path), _, _) => tokio::fs::read(path)
                .await
                .with_context(|| format!("reading listing {}", path.display()))
                .map_err(RunError::from),
            (None, Some(url), Some(fetcher)) => Ok(fetcher.fetch_bytes(url).await?),
            _ => Err(ConfigError::MissingSource.into()),
        }
    }

    /// Pages through the store, matching each page on the worker pool
    /// before asking for the next one.
    async fn match_targets(
        &self,
        catalog: &Arc<Vec<CatalogEntry>>,
        cancel: &CancelToken,
    ) -> Result<(Vec<TargetRecord>, Vec<MatchResult>), RunError> {
        let filter = TargetFilter {
            field: self.config.field.clone(),
            missing_only: self.config.missing_only,
        };
        let matcher = CatalogMatcher::new(self.config.matcher);
        let permits = Arc::new(Semaphore::new(self.config.workers));
        let page_size = self.config.page_size;

        let mut targets = Vec::new();
        let mut results = Vec::new();
        let mut offset = 0usize;
        loop {
            if cancel.is_cancelled() {
                info!(offset, "run cancelled between pages");
                return Err(RunError::Cancelled);
            }
            let page = self.store.fetch_page(&filter, offset, page_size).await?;
            let fetched = page.len();
            debug!(offset, fetched, "fetched target page");
            if fetched == 0 {
                break;
            }
            results.extend(match_page(&matcher, &permits, catalog, &page).await?);
            targets.extend(page);
            offset += fetched;
            if fetched < page_size {
                break;
            }
        }
        Ok((targets, results))
    }

    /// Matches every stored title against the catalog. With `missing_only`
    /// the populated targets are never fetched, and these results stand in
    /// for them so their entries are not proposed as inserts.
    async fn title_links(
        &self,
        catalog: &Arc<Vec<CatalogEntry>>,
        titles: &[String],
    ) -> Result<Vec<MatchResult>, RunError> {
        let targets: Vec<TargetRecord> = titles
            .iter()
            .enumerate()
            .map(|(i, title)| TargetRecord::new(format!("title#{i}"), title.as_str()))
            .collect();
        let matcher = CatalogMatcher::new(self.config.matcher);
        let catalog = Arc::clone(catalog);
        let links = tokio::task::spawn_blocking(move || matcher.match_all(&targets, &catalog))
            .await
            .map_err(|e| RunError::Worker(e.to_string()))?;
        debug!(
            titles = titles.len(),
            linked = links.iter().filter(|r| r.is_matched()).count(),
            "matched stored titles for insert planning"
        );
        Ok(links)
    }

    fn approved_keys(&self, approved: &StoredReport) -> Result<BTreeSet<ActionKey>, RunError> {
        if approved.mode != RunMode::DryRun {
            return Err(RunError::ApprovalNotDryRun {
                run_id: approved.run_id.clone(),
                mode: approved.mode,
            });
        }
        if approved.field != self.config.field {
            return Err(RunError::FieldMismatch {
                run_id: approved.run_id.clone(),
                approved: approved.field.clone(),
                configured: self.config.field.clone(),
            });
        }
        Ok(approved.approved_keys())
    }

    fn check_approved(
        &self,
        actions: &[ReconciliationAction],
        approved: &BTreeSet<ActionKey>,
        live: Option<&LiveOptions>,
    ) -> Result<(), RunError> {
        let unapproved = actions
            .iter()
            .filter(|a| a.action_type != ActionType::Skip)
            .filter(|a| !approved.contains(&ActionKey::from(*a)))
            .count();
        if unapproved == 0 {
            return Ok(());
        }
        let approved_run = live
            .map(|o| o.approved.run_id.clone())
            .unwrap_or_default();
        warn!(unapproved, approved_run = %approved_run, "plan differs from approved report");
        Err(RunError::NotApproved {
            approved_run,
            unapproved,
        })
    }

    /// One store call per action, in plan order. A failure is recorded on
    /// its action and the run moves on.
    async fn apply_actions(&self, actions: Vec<ReconciliationAction>) -> Vec<ActionRecord> {
        let mut records = Vec::with_capacity(actions.len());
        for action in actions {
            let record = match action.action_type {
                ActionType::Skip => ActionRecord::new(action, ActionStatus::Skipped),
                ActionType::UpdateField => self.apply_update(action).await,
                ActionType::InsertNew => self.apply_insert(action).await,
            };
            records.push(record);
        }
        records
    }

    async fn apply_update(&self, action: ReconciliationAction) -> ActionRecord {
        let field = &self.config.field;
        let (Some(target), Some(value)) = (action.target_id.clone(), action.payload.get(field).cloned())
        else {
            return failed(action, format!("update has no target or no value for '{field}'"));
        };
        match self.store.apply(&target, field, &value).await {
            Ok(()) => {
                info!(target = %target, field = %field, "field updated");
                ActionRecord::new(action, ActionStatus::Applied)
            }
            Err(err) => {
                warn!(target = %target, error = %err, "update failed");
                failed(action, err.to_string())
            }
        }
    }

    async fn apply_insert(&self, action: ReconciliationAction) -> ActionRecord {
        match self.store.insert(&action.payload).await {
            Ok(id) => {
                info!(id = %id, "record inserted");
                let mut record = ActionRecord::new(action, ActionStatus::Applied);
                record.created_id = Some(id);
                record
            }
            Err(err) => {
                warn!(error = %err, "insert failed");
                failed(action, err.to_string())
            }
        }
    }

    /// UUID v5 over everything that decides the report's content.
    fn run_id(
        &self,
        listing_sha256: &[u8],
        targets: &[TargetRecord],
        titles: &[String],
        mode: RunMode,
        resume: Option<&StoredReport>,
    ) -> Result<String, RunError> {
        let mut hasher = Sha256::new();
        hasher.update(listing_sha256);
        hasher.update(serde_json::to_vec(targets).context("hashing targets")?);
        hasher.update(serde_json::to_vec(titles).context("hashing titles")?);
        hasher.update(mode.to_string().as_bytes());
        hasher.update(serde_json::to_vec(&self.config.fingerprint()).context("hashing config")?);
        if let Some(previous) = resume {
            hasher.update(previous.run_id.as_bytes());
        }
        Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, &hasher.finalize()).to_string())
    }
}

fn failed(action: ReconciliationAction, error: String) -> ActionRecord {
    let mut record = ActionRecord::new(action, ActionStatus::Failed);
    record.error = Some(error);
    record
}

/// Scores every target of one page on the blocking pool, at most
/// `permits` at a time. Results come back in page order.
async fn match_page(
    matcher: &CatalogMatcher,
    permits: &Arc<Semaphore>,
    catalog: &Arc<Vec<CatalogEntry>>,
    page: &[TargetRecord],
) -> Result<Vec<MatchResult>, RunError> {
    let mut handles = Vec::with_capacity(page.len());
    for target in page {
        let permit = Arc::clone(permits)
            .acquire_owned()
            .await
            .map_err(|e| RunError::Worker(e.to_string()))?;
        let matcher = matcher.clone();
        let catalog = Arc::clone(catalog);
        let target = target.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            matcher.match_target(&target, &catalog)
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.map_err(|e| RunError::Worker(e.to_string()))?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let handle = token.clone();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn runner_rejects_invalid_config() {
        let config = ReconConfig::default();
        let err = BatchRunner::new(config, catrec_storage::MemoryStore::default())
            .err()
            .expect("missing source must be rejected");
        assert!(matches!(err, RunError::Config(ConfigError::MissingSource)));
    }
}
