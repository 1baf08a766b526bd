use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use catrec_adapters::ListingOptions;
use catrec_core::{DedupConfig, MatcherConfig, PlannerConfig};
use catrec_storage::{is_safe_identifier, BackoffPolicy, PgStoreConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "catrec.yaml";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must lie in [0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },
    #[error("page_size must lie in 1..=1000, got {0}")]
    PageSize(usize),
    #[error("workers must be at least 1")]
    NoWorkers,
    #[error("store_timeout_secs must be at least 1")]
    NoStoreTimeout,
    #[error("source needs either `path` or `url`")]
    MissingSource,
    #[error("source sets both `path` and `url`")]
    AmbiguousSource,
    #[error("postgres store needs `url` or DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("unsafe identifier '{0}'")]
    UnsafeIdentifier(String),
    #[error("inserts would drop '{0}': add it to store.layout.insert_columns or disable planner.insert_unmatched")]
    FieldNotInserted(String),
}

/// Where the source listing comes from and how to read it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    #[serde(flatten)]
    pub listing: ListingOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Json {
        path: PathBuf,
    },
    Postgres {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        layout: PgStoreConfig,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Json {
            path: PathBuf::from("records.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub insert_unmatched: bool,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            insert_unmatched: true,
        }
    }
}

/// Contents of `catrec.yaml`. Every field has a default, so an empty file
/// is a valid (if not very useful) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub field: String,
    pub missing_only: bool,
    pub page_size: usize,
    pub workers: usize,
    pub store_timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub dedup: DedupConfig,
    pub matcher: MatcherConfig,
    pub planner: PlannerSection,
    pub reports_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            store: StoreConfig::default(),
            field: "locator".to_string(),
            missing_only: false,
            page_size: 50,
            workers: 4,
            store_timeout_secs: 5,
            max_retries: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 5_000,
            dedup: DedupConfig::default(),
            matcher: MatcherConfig::default(),
            planner: PlannerSection::default(),
            reports_dir: PathBuf::from("./reports"),
            http_timeout_secs: 5,
            user_agent: "catrec/0.1".to_string(),
        }
    }
}

/// The settings that decide what a run proposes. Part of the run id.
#[derive(Debug, Serialize)]
pub(crate) struct PlanFingerprint<'a> {
    field: &'a str,
    missing_only: bool,
    listing: &'a ListingOptions,
    dedup: &'a DedupConfig,
    matcher: &'a MatcherConfig,
    insert_unmatched: bool,
}

impl ReconConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Reads the file, applies environment overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config =
            Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = parsed("CATREC_PAGE_SIZE") {
            self.page_size = v as usize;
        }
        if let Some(v) = parsed("CATREC_WORKERS") {
            self.workers = v as usize;
        }
        if let Some(v) = parsed("CATREC_STORE_TIMEOUT_SECS") {
            self.store_timeout_secs = v;
        }
        if let Some(v) = parsed("CATREC_MAX_RETRIES") {
            self.max_retries = v as usize;
        }
        if let Some(dir) = lookup("CATREC_REPORTS_DIR").filter(|v| !v.trim().is_empty()) {
            self.reports_dir = PathBuf::from(dir);
        }
        if let StoreConfig::Postgres { url, .. } = &mut self.store {
            if let Some(database_url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
                *url = Some(database_url);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = [
            ("dedup.threshold", self.dedup.threshold),
            ("matcher.threshold", self.matcher.threshold),
            ("matcher.long_threshold", self.matcher.long_threshold),
            ("matcher.review_floor", self.matcher.review_floor),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }

        if !(1..=1000).contains(&self.page_size) {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.store_timeout_secs == 0 {
            return Err(ConfigError::NoStoreTimeout);
        }

        match (&self.source.path, &self.source.url) {
            (None, None) => return Err(ConfigError::MissingSource),
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousSource),
            _ => {}
        }

        if !is_safe_identifier(&self.field) {
            return Err(ConfigError::UnsafeIdentifier(self.field.clone()));
        }
        if let StoreConfig::Postgres { url, layout } = &self.store {
            if url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                return Err(ConfigError::MissingDatabaseUrl);
            }
            let names = [&layout.table, &layout.id_column, &layout.title_column]
                .into_iter()
                .chain(layout.insert_columns.iter());
            for name in names {
                if !is_safe_identifier(name) {
                    return Err(ConfigError::UnsafeIdentifier(name.clone()));
                }
            }
            if self.planner.insert_unmatched && !layout.insert_columns.contains(&self.field) {
                return Err(ConfigError::FieldNotInserted(self.field.clone()));
            }
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            field: self.field.clone(),
            insert_unmatched: self.planner.insert_unmatched,
        }
    }

    pub(crate) fn fingerprint(&self) -> PlanFingerprint<'_> {
        PlanFingerprint {
            field: &self.field,
            missing_only: self.missing_only,
            listing: &self.source.listing,
            dedup: &self.dedup,
            matcher: &self.matcher,
            insert_unmatched: self.planner.insert_unmatched,
        }
    }
}
