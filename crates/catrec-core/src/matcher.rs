//! Best-match linking of one target record against a source catalog.

use serde::{Deserialize, Serialize};

use crate::model::{CatalogEntry, MatchDecision, MatchResult, TargetRecord};
use crate::normalize::normalize;
use crate::similarity::similarity;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Acceptance threshold for short titles.
    pub threshold: f64,
    /// Acceptance threshold when both normalized titles are long.
    pub long_threshold: f64,
    /// Titles longer than this many chars count as long.
    pub long_title_len: usize,
    /// Near misses scoring at least this are reported as `below_threshold`.
    pub review_floor: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: 0.90,
            long_threshold: 0.85,
            long_title_len: 15,
            review_floor: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    entry: &'a CatalogEntry,
    score: f64,
}

/// Stateless per call: safe to share across worker threads.
#[derive(Debug, Clone)]
pub struct CatalogMatcher {
    config: MatcherConfig,
}

impl CatalogMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn acceptance_threshold(&self, target: &str, candidate: &str) -> f64 {
        let long = self.config.long_title_len;
        if target.chars().count() > long && candidate.chars().count() > long {
            self.config.long_threshold
        } else {
            self.config.threshold
        }
    }

    /// Scores every non-duplicate entry and keeps the best one. Equal scores
    /// go to the lower index. A title with nothing left after normalization
    /// never matches.
    pub fn match_target(&self, target: &TargetRecord, catalog: &[CatalogEntry]) -> MatchResult {
        let normalized_target = normalize(&target.title);

        let candidates: &[CatalogEntry] = if normalized_target.is_empty() { &[] } else { catalog };

        let mut best: Option<Candidate<'_>> = None;
        for entry in candidates.iter().filter(|e| !e.is_duplicate) {
            let score = similarity(&normalized_target, entry.normalized_name());
            let better = match best {
                None => true,
                Some(current) => {
                    score > current.score
                        || (score == current.score && entry.index < current.entry.index)
                }
            };
            if better {
                best = Some(Candidate { entry, score });
            }
        }

        let Some(best) = best else {
            return MatchResult {
                target_id: target.id.clone(),
                target_title: target.title.clone(),
                source_entry: None,
                confidence: 0.0,
                decision: MatchDecision::NoMatch,
                threshold: self.config.threshold,
                candidate_index: None,
            };
        };

        let threshold = self.acceptance_threshold(&normalized_target, best.entry.normalized_name());
        let decision = if best.score >= threshold {
            MatchDecision::Matched
        } else if best.score >= self.config.review_floor {
            MatchDecision::BelowThreshold
        } else {
            MatchDecision::NoMatch
        };

        MatchResult {
            target_id: target.id.clone(),
            target_title: target.title.clone(),
            source_entry: (decision == MatchDecision::Matched).then(|| best.entry.clone()),
            confidence: best.score,
            decision,
            threshold,
            candidate_index: Some(best.entry.index),
        }
    }

    pub fn match_all(&self, targets: &[TargetRecord], catalog: &[CatalogEntry]) -> Vec<MatchResult> {
        targets
            .iter()
            .map(|target| self.match_target(target, catalog))
            .collect()
    }
}

impl Default for CatalogMatcher {
    fn default() -> Self {
        Self::new(MatcherConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<CatalogEntry> {
        vec![
            CatalogEntry::new(0, "Wheelock's Latin.pdf", "https://files.example/wheelock.pdf", 9_000),
            CatalogEntry::new(1, "Oxford Latin Course Part 1.pdf", "https://files.example/olc1.pdf", 12_000),
            CatalogEntry::new(2, "Oxford Latin Course Part 2.pdf", "https://files.example/olc2.pdf", 13_000),
        ]
    }

    #[test]
    fn exact_title_with_extension_matches() {
        let matcher = CatalogMatcher::default();
        let result = matcher.match_target(&TargetRecord::new("t1", "Oxford Latin Course Part 1"), &catalog());
        assert_eq!(result.decision, MatchDecision::Matched);
        assert!(result.confidence >= 0.90);
        assert_eq!(result.source_entry.as_ref().map(|e| e.index), Some(1));
    }

    #[test]
    fn unrelated_title_is_no_match() {
        let matcher = CatalogMatcher::default();
        let result = matcher.match_target(&TargetRecord::new("t2", "Unrelated Biology Textbook"), &catalog());
        assert_eq!(result.decision, MatchDecision::NoMatch);
        assert!(result.source_entry.is_none());
    }

    #[test]
    fn ties_prefer_lower_index() {
        let catalog = vec![
            CatalogEntry::new(5, "Latin Grammar", "b", 1),
            CatalogEntry::new(2, "latin grammar.pdf", "a", 1),
        ];
        let result = CatalogMatcher::default().match_target(&TargetRecord::new("t", "Latin Grammar"), &catalog);
        assert_eq!(result.source_entry.map(|e| e.index), Some(2));
    }

    #[test]
    fn long_titles_use_the_lower_threshold() {
        let matcher = CatalogMatcher::default();
        // 20 chars each, 3 edits -> 0.85
        let catalog = vec![CatalogEntry::new(0, "abcdefghijklmnopqrst", "x", 1)];
        let result = matcher.match_target(&TargetRecord::new("t", "abcdefghijklmnopqXYZ"), &catalog);
        assert_eq!(result.threshold, 0.85);
        assert_eq!(result.decision, MatchDecision::Matched);

        // 10 chars each, 1 edit -> 0.9 against the short threshold
        let catalog = vec![CatalogEntry::new(0, "abcdefghij", "x", 1)];
        let result = matcher.match_target(&TargetRecord::new("t", "abcdefghiX"), &catalog);
        assert_eq!(result.threshold, 0.90);
        assert_eq!(result.decision, MatchDecision::Matched);

        let catalog = vec![CatalogEntry::new(0, "abcdefghij", "x", 1)];
        let result = matcher.match_target(&TargetRecord::new("t", "abcdefghXY"), &catalog);
        assert_eq!(result.decision, MatchDecision::BelowThreshold);
        assert!(result.source_entry.is_none());
        assert_eq!(result.candidate_index, Some(0));
    }

    #[test]
    fn duplicates_are_not_candidates() {
        let mut catalog = catalog();
        catalog[1].is_duplicate = true;
        catalog[1].duplicate_of = Some(0);
        let result = CatalogMatcher::default()
            .match_target(&TargetRecord::new("t1", "Oxford Latin Course Part 1"), &catalog);
        // Part 2 is one edit away and still clears the long-title threshold.
        assert_eq!(result.source_entry.map(|e| e.index), Some(2));
    }

    #[test]
    fn blank_titles_never_match() {
        let catalog = vec![CatalogEntry::new(0, "---.pdf", "https://files.example/dash.pdf", 10)];
        let result = CatalogMatcher::default().match_target(&TargetRecord::new("t", "???"), &catalog);
        assert_eq!(result.decision, MatchDecision::NoMatch);
        assert!(result.source_entry.is_none());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn empty_catalog_is_no_match() {
        let result = CatalogMatcher::default().match_target(&TargetRecord::new("t", "Anything"), &[]);
        assert_eq!(result.decision, MatchDecision::NoMatch);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.candidate_index, None);
    }
}
