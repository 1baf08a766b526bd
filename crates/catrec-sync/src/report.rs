use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use catrec_adapters::SkippedRecord;
use catrec_core::{
    normalize, ActionType, DuplicatePair, MatchDecision, MatchResult, ReconciliationAction,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const REPORT_SCHEMA_VERSION: u32 = 1;
pub const REPORT_JSON: &str = "report.json";
pub const BRIEF_MD: &str = "brief.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Live,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DryRun => write!(f, "dry_run"),
            Self::Live => write!(f, "live"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Proposed,
    Applied,
    Failed,
    Skipped,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proposed => write!(f, "proposed"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// A planned action and what became of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(flatten)]
    pub action: ReconciliationAction,
    pub status: ActionStatus,
    /// Id of the record an applied `insert_new` created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionRecord {
    pub fn new(action: ReconciliationAction, status: ActionStatus) -> Self {
        Self {
            action,
            status,
            created_id: None,
            error: None,
        }
    }

    /// `skip` is never written, so it is recorded as skipped in any mode.
    pub fn proposed(action: ReconciliationAction) -> Self {
        let status = match action.action_type {
            ActionType::Skip => ActionStatus::Skipped,
            ActionType::UpdateField | ActionType::InsertNew => ActionStatus::Proposed,
        };
        Self::new(action, status)
    }
}

/// What an operator approves: everything but the rationale text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ActionKey {
    action_type: ActionType,
    target_id: Option<String>,
    payload: BTreeMap<String, String>,
}

impl From<&ReconciliationAction> for ActionKey {
    fn from(action: &ReconciliationAction) -> Self {
        Self {
            action_type: action.action_type,
            target_id: action.target_id.clone(),
            payload: action.payload.clone(),
        }
    }
}

/// Where one target or insert candidate ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    MatchedUpdated,
    MatchedSkipped,
    MatchedFailed,
    MatchedProposed,
    NoMatch,
    Inserted,
    InsertFailed,
    InsertProposed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// A target id, or `source#<index>` for an insert candidate.
    pub subject: String,
    pub outcome: RecordOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTotals {
    pub processed: usize,
    pub matched: usize,
    pub below_threshold: usize,
    pub no_match: usize,
    pub updated: usize,
    pub proposed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub inserted: usize,
    pub insert_failed: usize,
    pub duplicates: usize,
    pub parse_errors: usize,
}

impl RunTotals {
    pub fn tally(
        results: &[MatchResult],
        actions: &[ActionRecord],
        duplicates: usize,
        parse_errors: usize,
    ) -> Self {
        let mut totals = Self {
            processed: results.len(),
            duplicates,
            parse_errors,
            ..Self::default()
        };
        for result in results {
            match result.decision {
                MatchDecision::Matched => totals.matched += 1,
                MatchDecision::BelowThreshold => totals.below_threshold += 1,
                MatchDecision::NoMatch => totals.no_match += 1,
            }
        }
        for record in actions {
            let counter = match (record.action.action_type, record.status) {
                (_, ActionStatus::Skipped) | (ActionType::Skip, _) => &mut totals.skipped,
                (_, ActionStatus::Proposed) => &mut totals.proposed,
                (ActionType::UpdateField, ActionStatus::Applied) => &mut totals.updated,
                (ActionType::UpdateField, ActionStatus::Failed) => &mut totals.failed,
                (ActionType::InsertNew, ActionStatus::Applied) => &mut totals.inserted,
                (ActionType::InsertNew, ActionStatus::Failed) => &mut totals.insert_failed,
            };
            *counter += 1;
        }
        totals
    }
}

/// Everything one run decided, without wall-clock data: identical inputs
/// serialize to identical bytes.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub run_id: String,
    pub mode: RunMode,
    pub field: String,
    pub plan_digest: String,
    pub totals: RunTotals,
    pub duplicates: Vec<DuplicatePair>,
    pub parse_errors: Vec<SkippedRecord>,
    pub matches: Vec<MatchResult>,
    pub actions: Vec<ActionRecord>,
    pub outcomes: Vec<OutcomeRecord>,
}

impl RunReport {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self).context("serializing run report")?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// SHA-256 over the serialized action list.
pub fn plan_digest(actions: &[ReconciliationAction]) -> Result<String> {
    let bytes = serde_json::to_vec(actions).context("serializing plan for digest")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn insert_subject(action: &ReconciliationAction) -> String {
    let index = action
        .payload
        .get("source_index")
        .map(String::as_str)
        .unwrap_or("?");
    format!("source#{index}")
}

/// One outcome per target, in result order, then one per insert candidate.
pub fn outcomes(results: &[MatchResult], actions: &[ActionRecord]) -> Vec<OutcomeRecord> {
    let by_target: BTreeMap<&str, &ActionRecord> = actions
        .iter()
        .filter_map(|r| r.action.target_id.as_deref().map(|id| (id, r)))
        .collect();

    let targets = results.iter().map(|result| {
        let outcome = match (result.decision, by_target.get(result.target_id.as_str())) {
            (MatchDecision::Matched, Some(record)) => {
                match (record.action.action_type, record.status) {
                    (ActionType::UpdateField, ActionStatus::Applied) => RecordOutcome::MatchedUpdated,
                    (ActionType::UpdateField, ActionStatus::Failed) => RecordOutcome::MatchedFailed,
                    (ActionType::UpdateField, ActionStatus::Proposed) => {
                        RecordOutcome::MatchedProposed
                    }
                    _ => RecordOutcome::MatchedSkipped,
                }
            }
            (MatchDecision::Matched, None) => RecordOutcome::MatchedSkipped,
            (MatchDecision::NoMatch | MatchDecision::BelowThreshold, _) => RecordOutcome::NoMatch,
        };
        OutcomeRecord {
            subject: result.target_id.clone(),
            outcome,
        }
    });

    let inserts = actions
        .iter()
        .filter(|r| r.action.action_type == ActionType::InsertNew)
        .map(|record| OutcomeRecord {
            subject: insert_subject(&record.action),
            outcome: match record.status {
                ActionStatus::Applied => RecordOutcome::Inserted,
                ActionStatus::Proposed => RecordOutcome::InsertProposed,
                ActionStatus::Failed | ActionStatus::Skipped => RecordOutcome::InsertFailed,
            },
        });

    targets.chain(inserts).collect()
}

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// The Markdown brief an operator reads before approving a live run.
pub fn render_brief(report: &RunReport) -> String {
    let t = &report.totals;
    let mut lines = vec![
        "# Catalog Reconciliation Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Mode: {}", report.mode),
        format!("- Field: `{}`", report.field),
        format!("- Plan digest: `{}`", report.plan_digest),
        String::new(),
        "## Totals".to_string(),
        format!("- processed: {}", t.processed),
        format!("- matched: {}", t.matched),
        format!("- below threshold: {}", t.below_threshold),
        format!("- no match: {}", t.no_match),
        format!("- updated: {}", t.updated),
        format!("- proposed: {}", t.proposed),
        format!("- skipped: {}", t.skipped),
        format!("- failed: {}", t.failed),
        format!("- inserted: {}", t.inserted),
        format!("- insert failed: {}", t.insert_failed),
        format!("- duplicates: {}", t.duplicates),
        format!("- parse errors: {}", t.parse_errors),
        String::new(),
        "## Actions".to_string(),
    ];

    if report.actions.is_empty() {
        lines.push("No actions.".to_string());
    } else {
        lines.push("| # | action | target | status | rationale |".to_string());
        lines.push("|---|---|---|---|---|".to_string());
        for (i, record) in report.actions.iter().enumerate() {
            let target = match record.action.action_type {
                ActionType::InsertNew => insert_subject(&record.action),
                _ => record.action.target_id.clone().unwrap_or_default(),
            };
            let mut rationale = cell(&record.action.rationale);
            if let Some(err) = &record.error {
                rationale.push_str(&format!(" (error: {})", cell(err)));
            }
            lines.push(format!(
                "| {} | {} | {} | {} | {} |",
                i + 1,
                record.action.action_type,
                cell(&target),
                record.status,
                rationale
            ));
        }
    }

    let near_misses: Vec<_> = report
        .matches
        .iter()
        .filter(|m| m.decision == MatchDecision::BelowThreshold)
        .collect();
    if !near_misses.is_empty() {
        lines.push(String::new());
        lines.push("## Near misses".to_string());
        for m in near_misses {
            let candidate = m
                .candidate_index
                .map(|i| format!("#{i}"))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "- `{}` '{}': best candidate {candidate} at {:.4} (needs {:.2})",
                m.target_id, m.target_title, m.confidence, m.threshold
            ));
        }
    }

    if !report.parse_errors.is_empty() {
        lines.push(String::new());
        lines.push("## Parse errors".to_string());
        for skipped in &report.parse_errors {
            lines.push(format!("- record {}: {}", skipped.ordinal, skipped.reason));
        }
    }

    if !report.duplicates.is_empty() {
        lines.push(String::new());
        lines.push("## Duplicates".to_string());
        for pair in &report.duplicates {
            lines.push(format!(
                "- #{} duplicates #{} ({:.4})",
                pair.duplicate, pair.original, pair.confidence
            ));
        }
    }

    if report.mode == RunMode::DryRun {
        lines.push(String::new());
        lines.push(format!(
            "Approve with `catrec apply --approve <reports_dir>/{}/{REPORT_JSON}`.",
            report.run_id
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// The parts of a committed `report.json` that later runs read back.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredReport {
    pub run_id: String,
    pub mode: RunMode,
    #[serde(default)]
    pub field: String,
    pub plan_digest: String,
    #[serde(default)]
    pub totals: RunTotals,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
}

impl StoredReport {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub(crate) fn approved_keys(&self) -> BTreeSet<ActionKey> {
        self.actions
            .iter()
            .filter(|r| r.action.action_type != ActionType::Skip)
            .map(|r| ActionKey::from(&r.action))
            .collect()
    }

    /// Targets whose update landed in this run.
    pub fn applied_targets(&self) -> BTreeSet<String> {
        self.actions
            .iter()
            .filter(|r| r.status == ActionStatus::Applied)
            .filter(|r| r.action.action_type == ActionType::UpdateField)
            .filter_map(|r| r.action.target_id.clone())
            .collect()
    }

    /// Normalized titles of records this run inserted.
    pub fn inserted_titles(&self) -> BTreeSet<String> {
        self.actions
            .iter()
            .filter(|r| r.status == ActionStatus::Applied)
            .filter(|r| r.action.action_type == ActionType::InsertNew)
            .filter_map(|r| r.action.payload.get("title"))
            .map(|title| normalize(title))
            .filter(|title| !title.is_empty())
            .collect()
    }
}

/// Markdown overview of the `runs` most recently committed reports.
pub fn recent_runs_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .filter(|entry| entry.path().join(REPORT_JSON).is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Catalog Reconciliation Runs".to_string(), String::new()];
    if dirs.is_empty() {
        lines.push("No runs recorded.".to_string());
    }
    for dir in dirs {
        let report = StoredReport::load(dir.path().join(REPORT_JSON))?;
        let t = &report.totals;
        lines.push(format!("## Run `{}` ({})", report.run_id, report.mode));
        lines.push(format!("- field: `{}`", report.field));
        lines.push(format!(
            "- processed {} / matched {} / below threshold {} / no match {}",
            t.processed, t.matched, t.below_threshold, t.no_match
        ));
        lines.push(format!(
            "- updated {} / proposed {} / skipped {} / failed {}",
            t.updated, t.proposed, t.skipped, t.failed
        ));
        lines.push(format!(
            "- inserted {} / insert failed {} / duplicates {} / parse errors {}",
            t.inserted, t.insert_failed, t.duplicates, t.parse_errors
        ));
        lines.push(format!("- plan digest: `{}`", report.plan_digest));
        let brief = dir.path().join(BRIEF_MD);
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
