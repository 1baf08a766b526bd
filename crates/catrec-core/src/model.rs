use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::normalize::normalize;

/// One item of a source listing, parsed fresh for every run.
///
/// `normalized_name` is derived from `raw_name` and is only reachable through
/// [`CatalogEntry::normalized_name`], so it can never drift from its source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub index: usize,
    pub raw_name: String,
    normalized_name: String,
    pub locator: String,
    pub size_bytes: u64,
    pub is_duplicate: bool,
    pub duplicate_of: Option<usize>,
}

impl CatalogEntry {
    pub fn new(
        index: usize,
        raw_name: impl Into<String>,
        locator: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let raw_name = raw_name.into();
        Self {
            index,
            normalized_name: normalize(&raw_name),
            raw_name,
            locator: locator.into(),
            size_bytes,
            is_duplicate: false,
            duplicate_of: None,
        }
    }

    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    pub fn has_known_size(&self) -> bool {
        self.size_bytes > 0
    }

    /// Marks this entry as a copy of `original`. First mark wins.
    pub(crate) fn mark_duplicate_of(&mut self, original: usize) {
        if self.duplicate_of.is_none() {
            self.is_duplicate = true;
            self.duplicate_of = Some(original);
        }
    }
}

/// A record of the target store, as returned by a page query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub existing_value: Option<String>,
}

impl TargetRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            existing_value: None,
        }
    }

    pub fn with_existing_value(mut self, value: impl Into<String>) -> Self {
        self.existing_value = Some(value.into());
        self
    }

    /// Blank strings count as missing: the gap is still there to fill.
    pub fn has_value(&self) -> bool {
        self.existing_value
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Matched,
    NoMatch,
    /// Best candidate scored at or above the review floor but under the
    /// acceptance threshold. Not linked; listed for human review.
    BelowThreshold,
}

impl std::fmt::Display for MatchDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::NoMatch => write!(f, "no_match"),
            Self::BelowThreshold => write!(f, "below_threshold"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub target_id: String,
    pub target_title: String,
    /// Present only when `decision == Matched`.
    pub source_entry: Option<CatalogEntry>,
    /// Score of the best candidate, whatever the decision. `0.0` for an
    /// empty catalog.
    pub confidence: f64,
    pub decision: MatchDecision,
    /// Acceptance threshold that applied to the best candidate.
    pub threshold: f64,
    /// Index of the best candidate, kept for review of near misses.
    pub candidate_index: Option<usize>,
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        self.decision == MatchDecision::Matched
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    UpdateField,
    InsertNew,
    Skip,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpdateField => write!(f, "update_field"),
            Self::InsertNew => write!(f, "insert_new"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// A proposal produced by the planner. Never applied by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationAction {
    pub action_type: ActionType,
    pub target_id: Option<String>,
    pub payload: BTreeMap<String, String>,
    pub rationale: String,
}
