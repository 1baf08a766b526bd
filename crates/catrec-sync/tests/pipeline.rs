use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catrec_core::TargetRecord;
use catrec_storage::{MemoryStore, RecordStore, StoreError, StoredRecord, TargetFilter};
use catrec_sync::{
    ActionStatus, BatchRunner, CancelToken, LiveOptions, RecordOutcome, ReconConfig, RunError,
    RunMode, SourceConfig, StoredReport,
};
use serde_json::json;
use tempfile::{tempdir, TempDir};

struct Fixture {
    dir: TempDir,
    config: ReconConfig,
}

impl Fixture {
    fn new(listing: &serde_json::Value) -> Self {
        let dir = tempdir().expect("tempdir");
        let listing_path = dir.path().join("listing.json");
        write_listing(&listing_path, listing);
        let config = ReconConfig {
            source: SourceConfig {
                path: Some(listing_path),
                ..SourceConfig::default()
            },
            reports_dir: dir.path().join("reports"),
            ..ReconConfig::default()
        };
        Self { dir, config }
    }

    fn listing_path(&self) -> PathBuf {
        self.dir.path().join("listing.json")
    }

    fn reports_dir(&self) -> PathBuf {
        self.config.reports_dir.clone()
    }
}

fn write_listing(path: &Path, listing: &serde_json::Value) {
    std::fs::write(path, serde_json::to_vec_pretty(listing).unwrap()).unwrap();
}

fn listing() -> serde_json::Value {
    json!([
        {"display_name": "Oxford Latin Course Part 1.pdf", "locator": "https://files.example/olc1.pdf", "size": "12.3 MB"},
        {"display_name": "Ecce Romani II.pdf", "locator": "https://files.example/ecce2.pdf", "size": 2048},
        {"display_name": "ecce_romani_II.pdf", "locator": "https://files.example/ecce2-copy.pdf", "size": 2048},
        {"display_name": "Wheelock's Latin Reader.pdf", "locator": "https://files.example/wheelock.pdf", "size": "-"},
        {"display_name": "", "locator": "https://files.example/blank.pdf", "size": 1}
    ])
}

fn targets() -> Vec<StoredRecord> {
    vec![
        StoredRecord::new("t1", "Oxford Latin Course Part 1"),
        StoredRecord::new("t2", "Ecce Romani II").with_field("locator", "https://old.example/ecce.pdf"),
        StoredRecord::new("t3", "Unrelated Biology Textbook"),
    ]
}

fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(targets()))
}

fn report_path(dir: &Path) -> PathBuf {
    dir.join("report.json")
}

fn outcome_of(report: &serde_json::Value, subject: &str) -> String {
    report["outcomes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["subject"] == subject)
        .map(|o| o["outcome"].as_str().unwrap().to_string())
        .unwrap_or_else(|| panic!("no outcome for {subject}"))
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[tokio::test]
async fn dry_run_proposes_without_writing() {
    let fixture = Fixture::new(&listing());
    let store = memory_store();
    let runner = BatchRunner::new(fixture.config.clone(), Arc::clone(&store)).expect("runner");

    let summary = runner.dry_run(&CancelToken::new()).await.expect("dry run");
    assert_eq!(summary.mode, RunMode::DryRun);
    assert_eq!(summary.totals.processed, 3);
    assert_eq!(summary.totals.matched, 2);
    assert_eq!(summary.totals.proposed, 2);
    assert_eq!(summary.totals.skipped, 1);
    assert_eq!(summary.totals.updated, 0);
    assert_eq!(summary.totals.duplicates, 1);
    assert_eq!(summary.totals.parse_errors, 1);
    assert_eq!(store.snapshot().await, targets());

    let report = read_json(&report_path(&summary.report_dir));
    assert_eq!(report["mode"], "dry_run");
    assert_eq!(report["plan_digest"], summary.plan_digest.as_str());
    assert_eq!(report["duplicates"][0]["original"], 1);
    assert_eq!(report["duplicates"][0]["duplicate"], 2);
    assert_eq!(outcome_of(&report, "t1"), "matched_proposed");
    assert_eq!(outcome_of(&report, "t2"), "matched_skipped");
    assert_eq!(outcome_of(&report, "t3"), "no_match");
    assert_eq!(outcome_of(&report, "source#3"), "insert_proposed");

    let actions = report["actions"].as_array().unwrap();
    let insert = actions
        .iter()
        .find(|a| a["action_type"] == "insert_new")
        .expect("insert proposal");
    assert_eq!(insert["payload"]["title"], "Wheelock's Latin Reader");
    assert!(actions.iter().all(|a| a["payload"]["source_index"] != "2"));

    for file in ["brief.md", "catalog.json", "snapshots/catalog.parquet", "snapshots/manifest.json"] {
        assert!(summary.report_dir.join(file).is_file(), "missing {file}");
    }
}

#[tokio::test]
async fn identical_inputs_give_byte_identical_reports() {
    let fixture = Fixture::new(&listing());
    let runner = BatchRunner::new(fixture.config.clone(), memory_store()).expect("runner");

    let first = runner.dry_run(&CancelToken::new()).await.expect("first");
    let first_report = std::fs::read(report_path(&first.report_dir)).unwrap();
    let first_brief = std::fs::read(first.report_dir.join("brief.md")).unwrap();

    let second = runner.dry_run(&CancelToken::new()).await.expect("second");
    assert_eq!(first.run_id, second.run_id);
    assert!(second.replaced);
    assert_eq!(first_report, std::fs::read(report_path(&second.report_dir)).unwrap());
    assert_eq!(first_brief, std::fs::read(second.report_dir.join("brief.md")).unwrap());
}

#[tokio::test]
async fn page_size_and_workers_do_not_change_the_plan() {
    let fixture = Fixture::new(&listing());
    let wide = BatchRunner::new(fixture.config.clone(), memory_store()).expect("runner");
    let wide = wide.dry_run(&CancelToken::new()).await.expect("wide");
    let wide_report = std::fs::read(report_path(&wide.report_dir)).unwrap();

    let narrow_config = ReconConfig {
        page_size: 1,
        workers: 1,
        ..fixture.config.clone()
    };
    let narrow = BatchRunner::new(narrow_config, memory_store()).expect("runner");
    let narrow = narrow.dry_run(&CancelToken::new()).await.expect("narrow");

    assert_eq!(wide.plan_digest, narrow.plan_digest);
    assert_eq!(wide.run_id, narrow.run_id);
    assert_eq!(wide_report, std::fs::read(report_path(&narrow.report_dir)).unwrap());
}

#[tokio::test]
async fn live_run_applies_approved_plan_and_reruns_cleanly() {
    let fixture = Fixture::new(&listing());
    let store = memory_store();
    let runner = BatchRunner::new(fixture.config.clone(), Arc::clone(&store)).expect("runner");

    let dry = runner.dry_run(&CancelToken::new()).await.expect("dry run");
    let approved = StoredReport::load(report_path(&dry.report_dir)).expect("approved report");

    let live = runner
        .live_run(&LiveOptions::new(approved.clone()), &CancelToken::new())
        .await
        .expect("live run");
    assert_eq!(live.mode, RunMode::Live);
    assert_ne!(live.run_id, dry.run_id);
    assert_eq!(live.totals.updated, 1);
    assert_eq!(live.totals.inserted, 1);
    assert_eq!(live.totals.failed, 0);

    let records = store.snapshot().await;
    assert_eq!(records.len(), 4);
    assert_eq!(
        records[0].fields.get("locator").map(String::as_str),
        Some("https://files.example/olc1.pdf")
    );
    assert_eq!(
        records[1].fields.get("locator").map(String::as_str),
        Some("https://old.example/ecce.pdf")
    );
    assert_eq!(records[3].title, "Wheelock's Latin Reader");

    let live_report = read_json(&report_path(&live.report_dir));
    assert_eq!(outcome_of(&live_report, "t1"), "matched_updated");
    assert_eq!(outcome_of(&live_report, "source#3"), "inserted");

    let previous = StoredReport::load(report_path(&live.report_dir)).expect("live report");
    assert_eq!(previous.applied_targets().len(), 1);
    let rerun = runner
        .live_run(
            &LiveOptions::new(approved).resuming(previous),
            &CancelToken::new(),
        )
        .await
        .expect("rerun");
    assert_eq!(rerun.totals.processed, 4);
    assert_eq!(rerun.totals.updated, 0);
    assert_eq!(rerun.totals.inserted, 0);
    assert_eq!(rerun.totals.skipped, 3);
    assert_eq!(store.snapshot().await.len(), 4);
}

#[tokio::test]
async fn live_run_refuses_actions_nobody_approved() {
    let fixture = Fixture::new(&listing());
    let store = memory_store();
    let runner = BatchRunner::new(fixture.config.clone(), Arc::clone(&store)).expect("runner");

    let dry = runner.dry_run(&CancelToken::new()).await.expect("dry run");
    let approved = StoredReport::load(report_path(&dry.report_dir)).expect("approved");

    let mut changed = listing();
    changed.as_array_mut().unwrap().push(json!({
        "display_name": "Cambridge Latin Course Book 1.pdf",
        "locator": "https://files.example/clc1.pdf",
        "size": "3 MB"
    }));
    write_listing(&fixture.listing_path(), &changed);

    let err = runner
        .live_run(&LiveOptions::new(approved), &CancelToken::new())
        .await
        .expect_err("unapproved insert must block the run");
    assert!(matches!(err, RunError::NotApproved { unapproved: 1, .. }));
    assert_eq!(store.snapshot().await, targets());
}

#[tokio::test]
async fn live_report_cannot_serve_as_approval() {
    let fixture = Fixture::new(&listing());
    let runner = BatchRunner::new(fixture.config.clone(), memory_store()).expect("runner");

    let dry = runner.dry_run(&CancelToken::new()).await.expect("dry run");
    let approved = StoredReport::load(report_path(&dry.report_dir)).expect("approved");
    let live = runner
        .live_run(&LiveOptions::new(approved), &CancelToken::new())
        .await
        .expect("live");
    let live_report = StoredReport::load(report_path(&live.report_dir)).expect("live report");

    let err = runner
        .live_run(&LiveOptions::new(live_report), &CancelToken::new())
        .await
        .expect_err("live report is not an approval");
    assert!(matches!(err, RunError::ApprovalNotDryRun { mode: RunMode::Live, .. }));
}

#[tokio::test]
async fn cancelled_run_writes_nothing() {
    let fixture = Fixture::new(&listing());
    let runner = BatchRunner::new(fixture.config.clone(), memory_store()).expect("runner");

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = runner.dry_run(&cancel).await.expect_err("cancelled");
    assert!(matches!(err, RunError::Cancelled));
    assert!(!fixture.reports_dir().exists());
}

/// Raises the cancel flag as soon as the first page has been served.
struct CancelAfterFirstPage {
    inner: MemoryStore,
    cancel: CancelToken,
    pages: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl RecordStore for CancelAfterFirstPage {
    async fn fetch_page(
        &self,
        filter: &TargetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TargetRecord>, StoreError> {
        self.pages.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let page = self.inner.fetch_page(filter, offset, limit).await;
        self.cancel.cancel();
        page
    }

    async fn apply(&self, id: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.inner.apply(id, field, value).await
    }

    async fn insert(&self, payload: &BTreeMap<String, String>) -> Result<String, StoreError> {
        self.inner.insert(payload).await
    }

    async fn list_titles(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_titles().await
    }
}

#[tokio::test]
async fn cancellation_takes_effect_between_pages() {
    let fixture = Fixture::new(&listing());
    let cancel = CancelToken::new();
    let store = Arc::new(CancelAfterFirstPage {
        inner: MemoryStore::new(targets()),
        cancel: cancel.clone(),
        pages: Default::default(),
    });
    let config = ReconConfig {
        page_size: 1,
        ..fixture.config.clone()
    };
    let runner = BatchRunner::new(config, Arc::clone(&store)).expect("runner");

    let err = runner.dry_run(&cancel).await.expect_err("cancelled");
    assert!(matches!(err, RunError::Cancelled));
    assert_eq!(store.pages.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(!fixture.reports_dir().exists());
}

/// Never answers `apply` for one record in time.
struct StallingStore {
    inner: MemoryStore,
    stall_id: &'static str,
}

#[async_trait]
impl RecordStore for StallingStore {
    async fn fetch_page(
        &self,
        filter: &TargetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TargetRecord>, StoreError> {
        self.inner.fetch_page(filter, offset, limit).await
    }

    async fn apply(&self, id: &str, field: &str, value: &str) -> Result<(), StoreError> {
        if id == self.stall_id {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.apply(id, field, value).await
    }

    async fn insert(&self, payload: &BTreeMap<String, String>) -> Result<String, StoreError> {
        self.inner.insert(payload).await
    }

    async fn list_titles(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_titles().await
    }
}

#[tokio::test]
async fn store_timeout_marks_only_that_action_failed() {
    let fixture = Fixture::new(&listing());
    let config = ReconConfig {
        store_timeout_secs: 1,
        max_retries: 0,
        ..fixture.config.clone()
    };
    let store = Arc::new(StallingStore {
        inner: MemoryStore::new(targets()),
        stall_id: "t1",
    });
    let runner = BatchRunner::new(config, Arc::clone(&store)).expect("runner");

    let dry = runner.dry_run(&CancelToken::new()).await.expect("dry run");
    let approved = StoredReport::load(report_path(&dry.report_dir)).expect("approved");
    let live = runner
        .live_run(&LiveOptions::new(approved), &CancelToken::new())
        .await
        .expect("live run completes despite the timeout");

    assert_eq!(live.totals.failed, 1);
    assert_eq!(live.totals.inserted, 1);

    let report = StoredReport::load(report_path(&live.report_dir)).expect("report");
    let failed = report
        .actions
        .iter()
        .find(|a| a.status == ActionStatus::Failed)
        .expect("failed action");
    assert_eq!(failed.action.target_id.as_deref(), Some("t1"));
    assert!(failed.error.as_deref().unwrap_or_default().contains("timed out"));

    let raw = read_json(&report_path(&live.report_dir));
    assert_eq!(outcome_of(&raw, "t1"), "matched_failed");
    assert_eq!(
        serde_json::from_value::<RecordOutcome>(raw["outcomes"][0]["outcome"].clone()).unwrap(),
        RecordOutcome::MatchedFailed
    );
    assert!(store.inner.snapshot().await[0].fields.get("locator").is_none());
}

#[tokio::test]
async fn delimited_listing_runs_end_to_end() {
    let dir = tempdir().expect("tempdir");
    let listing_path = dir.path().join("listing.tsv");
    std::fs::write(
        &listing_path,
        "name\tlocator\tsize\n\
         The Great Gatsby.pdf\thttps://files.example/gatsby.pdf\t1 MB\n",
    )
    .unwrap();
    let yaml = format!(
        "source:\n  path: {}\n  format: delimited\nreports_dir: {}\nplanner:\n  insert_unmatched: false\n",
        listing_path.display(),
        dir.path().join("reports").display()
    );
    let config = ReconConfig::from_yaml_str(&yaml).expect("config");
    let store = Arc::new(MemoryStore::new(vec![StoredRecord::new("g1", "The Great Gatsby")]));
    let runner = BatchRunner::new(config, store).expect("runner");

    let summary = runner.dry_run(&CancelToken::new()).await.expect("dry run");
    assert_eq!(summary.totals.matched, 1);
    assert_eq!(summary.totals.proposed, 1);

    let report = read_json(&report_path(&summary.report_dir));
    assert_eq!(report["matches"][0]["confidence"], 1.0);
    assert_eq!(
        report["actions"][0]["payload"]["locator"],
        "https://files.example/gatsby.pdf"
    );
}

#[tokio::test]
async fn missing_only_never_proposes_inserts_for_linked_entries() {
    let listing = json!([
        {"display_name": "Oxford Latin Course Pt 1.pdf", "locator": "https://files.example/olc1.pdf", "size": 10},
        {"display_name": "Greek Primer.pdf", "locator": "https://files.example/greek.pdf", "size": 20}
    ]);
    let records = || {
        vec![StoredRecord::new("t1", "Oxford Latin Course Part 1")
            .with_field("locator", "https://old.example/olc1.pdf")]
    };

    let mut inserts = Vec::new();
    for missing_only in [false, true] {
        let mut fixture = Fixture::new(&listing);
        fixture.config.missing_only = missing_only;
        let runner = BatchRunner::new(fixture.config.clone(), MemoryStore::new(records())).expect("runner");
        let summary = runner.dry_run(&CancelToken::new()).await.expect("dry run");
        assert_eq!(summary.totals.processed, if missing_only { 0 } else { 1 });

        let report = read_json(&report_path(&summary.report_dir));
        let titles: Vec<String> = report["actions"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|a| a["action_type"] == "insert_new")
            .map(|a| a["payload"]["title"].as_str().unwrap().to_string())
            .collect();
        inserts.push(titles);
    }

    assert_eq!(inserts[0], ["Greek Primer"]);
    assert_eq!(inserts[0], inserts[1]);
}

#[tokio::test]
async fn catalog_export_skips_the_store() {
    let fixture = Fixture::new(&listing());
    let store = memory_store();
    let runner = BatchRunner::new(fixture.config.clone(), Arc::clone(&store)).expect("runner");

    let export = runner.export_catalog().await.expect("export");
    assert_eq!(export.entries, 4);
    assert_eq!(export.duplicates, 1);
    assert_eq!(export.parse_errors, 1);
    assert!(export.dir.join("duplicates.json").is_file());

    let catalog = read_json(&export.dir.join("catalog.json"));
    assert_eq!(catalog[2]["is_duplicate"], true);
    assert_eq!(catalog[2]["duplicate_of"], 1);
    assert_eq!(store.snapshot().await, targets());
}
