//! Local-window duplicate detection inside one catalog listing.

use serde::{Deserialize, Serialize};

use crate::model::CatalogEntry;
use crate::similarity::similarity;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Reach on each side of an entry, in listing index units.
    pub window: usize,
    /// Name similarity must be strictly greater than this.
    pub threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: 10,
            threshold: 0.6,
        }
    }
}

/// A detected pair: `duplicate` now points at `original`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicatePair {
    pub original: usize,
    pub duplicate: usize,
    pub confidence: f64,
}

pub struct DuplicateDetector {
    config: DedupConfig,
}

impl DuplicateDetector {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Equal, known sizes are a hard precondition; the name score only
    /// decides between entries that already pass it.
    pub fn is_duplicate_pair(&self, a: &CatalogEntry, b: &CatalogEntry) -> Option<f64> {
        if !a.has_known_size() || a.size_bytes != b.size_bytes {
            return None;
        }
        let score = similarity(a.normalized_name(), b.normalized_name());
        (score > self.config.threshold).then_some(score)
    }

    /// Annotates `entries` in ascending index order and returns the pairs found.
    ///
    /// Entry `i` is compared with entries whose index lies in
    /// `[i - window, i + window]`; gaps left by skipped records shrink the
    /// reach rather than extending it. An entry already marked duplicate
    /// neither anchors nor receives further marks, so `duplicate_of` always
    /// names an original.
    pub fn apply(&self, mut entries: Vec<CatalogEntry>) -> (Vec<CatalogEntry>, Vec<DuplicatePair>) {
        entries.sort_by_key(|e| e.index);
        let mut pairs = Vec::new();

        for i in 0..entries.len() {
            if entries[i].is_duplicate {
                continue;
            }
            let lo = i.saturating_sub(self.config.window);
            let hi = (i + self.config.window).min(entries.len().saturating_sub(1));

            // Indexes are unique and sorted, so the slot range covers every
            // entry within `window` indexes.
            for j in lo..=hi {
                if j == i || entries[j].is_duplicate {
                    continue;
                }
                if entries[i].index.abs_diff(entries[j].index) > self.config.window {
                    continue;
                }
                let Some(score) = self.is_duplicate_pair(&entries[i], &entries[j]) else {
                    continue;
                };

                let (original, duplicate) = if i < j { (i, j) } else { (j, i) };
                let original_index = entries[original].index;
                entries[duplicate].mark_duplicate_of(original_index);
                pairs.push(DuplicatePair {
                    original: original_index,
                    duplicate: entries[duplicate].index,
                    confidence: score,
                });

                if duplicate == i {
                    break;
                }
            }
        }

        (entries, pairs)
    }

    pub fn detect(&self, entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
        self.apply(entries).0
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
