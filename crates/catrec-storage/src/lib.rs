//! Record-store access, bounded retries, listing fetch and atomic report
//! storage for catrec.

mod fetch;
mod json_file;
mod memory;
mod postgres;
mod reports;
mod retry;
mod store;

pub use fetch::{FetchError, HttpClientConfig, HttpFetcher};
pub use json_file::JsonFileStore;
pub use memory::{MemoryStore, StoredRecord};
pub use postgres::{PgStore, PgStoreConfig};
pub use reports::{write_file_atomic, CommittedReport, ReportFile, ReportStore, StoredFile};
pub use retry::{BackoffPolicy, RetryDisposition, RetryingStore};
pub use store::{is_safe_identifier, RecordStore, StoreError, TargetFilter};

pub const CRATE_NAME: &str = "catrec-storage";
