//! Turns match results into reviewable proposals. Performs no I/O.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{ActionType, CatalogEntry, MatchResult, ReconciliationAction};
use crate::normalize::display_title;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Target field filled from the matched entry's locator.
    pub field: String,
    /// Propose `insert_new` for catalog entries no target links to.
    pub insert_unmatched: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            field: "locator".to_string(),
            insert_unmatched: true,
        }
    }
}

pub struct ReconciliationPlanner {
    config: PlannerConfig,
}

impl ReconciliationPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// One action per matched result: `update_field` when the target has a
    /// gap, `skip` when it is already linked. Populated fields are never
    /// overwritten. Unmatched results produce no action.
    pub fn plan(
        &self,
        results: &[MatchResult],
        existing_targets: &BTreeSet<String>,
    ) -> Vec<ReconciliationAction> {
        results
            .iter()
            .filter(|r| r.is_matched())
            .filter_map(|result| {
                let entry = result.source_entry.as_ref()?;
                Some(self.plan_matched(result, entry, existing_targets))
            })
            .collect()
    }

    fn plan_matched(
        &self,
        result: &MatchResult,
        entry: &CatalogEntry,
        existing_targets: &BTreeSet<String>,
    ) -> ReconciliationAction {
        let field = &self.config.field;
        if existing_targets.contains(&result.target_id) {
            return ReconciliationAction {
                action_type: ActionType::Skip,
                target_id: Some(result.target_id.clone()),
                payload: BTreeMap::new(),
                rationale: format!(
                    "matched source #{} with confidence {:.4} but '{field}' is already populated",
                    entry.index, result.confidence
                ),
            };
        }

        ReconciliationAction {
            action_type: ActionType::UpdateField,
            target_id: Some(result.target_id.clone()),
            payload: BTreeMap::from([(field.clone(), entry.locator.clone())]),
            rationale: format!(
                "'{field}' is empty; matched source #{} '{}' with confidence {:.4} (threshold {:.2})",
                entry.index, entry.raw_name, result.confidence, result.threshold
            ),
        }
    }

    /// `insert_new` proposals for original entries that no target matched and
    /// whose normalized name equals no known target title. Within one plan a
    /// normalized name is proposed once, for its lowest-index entry.
    ///
    /// Existence is judged by exact normalized-title equality only, so a
    /// near-miss title can still be proposed for insertion.
    pub fn plan_inserts(
        &self,
        catalog: &[CatalogEntry],
        results: &[MatchResult],
        known_titles: &BTreeSet<String>,
    ) -> Vec<ReconciliationAction> {
        if !self.config.insert_unmatched {
            return Vec::new();
        }

        let linked: BTreeSet<usize> = results
            .iter()
            .filter_map(|r| r.source_entry.as_ref().map(|e| e.index))
            .collect();

        let mut entries: Vec<&CatalogEntry> = catalog
            .iter()
            .filter(|e| !e.is_duplicate)
            .filter(|e| !e.normalized_name().is_empty())
            .filter(|e| !linked.contains(&e.index))
            .filter(|e| !known_titles.contains(e.normalized_name()))
            .collect();
        entries.sort_by_key(|e| e.index);

        let mut proposed = BTreeSet::new();
        entries
            .into_iter()
            .filter(|e| proposed.insert(e.normalized_name().to_string()))
            .map(|entry| ReconciliationAction {
                action_type: ActionType::InsertNew,
                target_id: None,
                payload: BTreeMap::from([
                    ("title".to_string(), display_title(&entry.raw_name)),
                    (self.config.field.clone(), entry.locator.clone()),
                    ("size_bytes".to_string(), entry.size_bytes.to_string()),
                    ("source_index".to_string(), entry.index.to_string()),
                ]),
                rationale: format!(
                    "source #{} '{}' has no corresponding target",
                    entry.index, entry.raw_name
                ),
            })
            .collect()
    }

}

impl Default for ReconciliationPlanner {
    fn default() -> Self {
        Self::new(PlannerConfig::default())
    }
}
