//! Core domain model and pure reconciliation components for catrec.
//!
//! Nothing in this crate performs I/O. Normalization and scoring are total
//! functions; only parsing of collaborator-supplied sizes can fail.

pub mod dedup;
pub mod matcher;
pub mod model;
pub mod normalize;
pub mod planner;
pub mod similarity;
pub mod size;

pub use dedup::{DedupConfig, DuplicateDetector, DuplicatePair};
pub use matcher::{CatalogMatcher, MatcherConfig};
pub use model::{
    ActionType, CatalogEntry, MatchDecision, MatchResult, ReconciliationAction, TargetRecord,
};
pub use normalize::{display_title, normalize};
pub use planner::{PlannerConfig, ReconciliationPlanner};
pub use similarity::{edit_distance, similarity};
pub use size::{parse_size, ParseError, SizeValue};

pub const CRATE_NAME: &str = "catrec-core";
