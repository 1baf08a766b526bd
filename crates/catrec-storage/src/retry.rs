use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use catrec_core::TargetRecord;
use tracing::{debug, info_span, warn, Instrument};

use crate::store::{RecordStore, StoreError, TargetFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    pub fn of(err: &StoreError) -> Self {
        match err {
            StoreError::Timeout { .. } | StoreError::Unavailable(_) => Self::Retryable,
            StoreError::NotFound(_)
            | StoreError::Conflict { .. }
            | StoreError::Rejected(_)
            | StoreError::Backend(_) => Self::NonRetryable,
        }
    }
}

/// Retry budget shared by store calls and listing fetches.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Attempts after the first one.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Pause after failed attempt `attempt` (zero-based): `base_delay`
    /// doubled per attempt, never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = u32::try_from(attempt).unwrap_or(u32::MAX);
        match 2u32.checked_pow(doublings) {
            Some(factor) => self.base_delay.saturating_mul(factor).min(self.max_delay),
            None => self.max_delay,
        }
    }
}

/// Puts every call of the wrapped store under a deadline and retries
/// transient failures with exponential backoff.
///
/// Inserts are not retried after a timeout: the first attempt may have
/// landed, and a second one would create a twin record.
pub struct RetryingStore<S> {
    inner: S,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl<S: RecordStore> RetryingStore<S> {
    pub fn new(inner: S, timeout: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            inner,
            timeout,
            backoff,
        }
    }

    #[cfg(test)]
    fn inner(&self) -> &S {
        &self.inner
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        retry_timeouts: bool,
        mut attempt_fn: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0usize;
        loop {
            let span = info_span!("store_call", operation, attempt);
            let outcome = match tokio::time::timeout(self.timeout, attempt_fn())
                .instrument(span)
                .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(StoreError::Timeout {
                    operation,
                    after: self.timeout,
                }),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retryable = RetryDisposition::of(&err) == RetryDisposition::Retryable
                && (retry_timeouts || !matches!(err, StoreError::Timeout { .. }));
            if !retryable || attempt >= self.backoff.max_retries {
                warn!(operation, attempt, error = %err, "store call failed");
                return Err(err);
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(operation, attempt, ?delay, error = %err, "retrying store call");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for RetryingStore<S> {
    async fn fetch_page(
        &self,
        filter: &TargetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TargetRecord>, StoreError> {
        self.call("fetch_page", true, || self.inner.fetch_page(filter, offset, limit))
            .await
    }

    async fn apply(&self, id: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.call("apply", true, || self.inner.apply(id, field, value))
            .await
    }

    async fn insert(&self, payload: &BTreeMap<String, String>) -> Result<String, StoreError> {
        self.call("insert", false, || self.inner.insert(payload)).await
    }

    async fn list_titles(&self) -> Result<Vec<String>, StoreError> {
        self.call("list_titles", true, || self.inner.list_titles())
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::memory::{MemoryStore, StoredRecord};

    /// Fails the first `failures` calls of each kind, optionally by hanging.
    struct FlakyStore {
        inner: MemoryStore,
        failures: usize,
        hang: bool,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize, hang: bool) -> Self {
            Self {
                inner: MemoryStore::new(vec![StoredRecord::new("1", "Latin Reader")]),
                failures,
                hang,
                calls: AtomicUsize::new(0),
            }
        }

        async fn gate(&self) -> Result<(), StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.hang {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                return Err(StoreError::Unavailable(format!("attempt {n}")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn fetch_page(
            &self,
            filter: &TargetFilter,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<TargetRecord>, StoreError> {
            self.gate().await?;
            self.inner.fetch_page(filter, offset, limit).await
        }

        async fn apply(&self, id: &str, field: &str, value: &str) -> Result<(), StoreError> {
            self.gate().await?;
            self.inner.apply(id, field, value).await
        }

        async fn insert(&self, payload: &BTreeMap<String, String>) -> Result<String, StoreError> {
            self.gate().await?;
            self.inner.insert(payload).await
        }

        async fn list_titles(&self) -> Result<Vec<String>, StoreError> {
            self.gate().await?;
            self.inner.list_titles().await
        }
    }

    fn fast_backoff(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn store_retries_wait_out_the_capped_backoff() {
        // Pauses of 20, 30 (capped from 40) and 30 ms before the fourth call.
        let backoff = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(30),
        };
        let store = RetryingStore::new(FlakyStore::new(3, false), Duration::from_secs(1), backoff);

        let started = tokio::time::Instant::now();
        store.apply("1", "locator", "https://x/a.pdf").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 4);
        assert_eq!(backoff.delay_for_attempt(usize::MAX), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = RetryingStore::new(FlakyStore::new(2, false), Duration::from_secs(1), fast_backoff(3));
        store.apply("1", "locator", "https://x/a.pdf").await.unwrap();
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let store = RetryingStore::new(FlakyStore::new(10, false), Duration::from_secs(1), fast_backoff(2));
        let err = store.list_titles().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hung_calls_time_out() {
        let store = RetryingStore::new(FlakyStore::new(10, true), Duration::from_millis(20), fast_backoff(1));
        let err = store.apply("1", "locator", "v").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { operation: "apply", .. }));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn inserts_are_not_retried_after_timeout() {
        let store = RetryingStore::new(FlakyStore::new(10, true), Duration::from_millis(20), fast_backoff(3));
        let payload = BTreeMap::from([("title".to_string(), "Greek Primer".to_string())]);
        let err = store.insert(&payload).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conflicts_fail_fast() {
        let inner = MemoryStore::new(vec![StoredRecord::new("1", "t").with_field("locator", "old")]);
        let store = RetryingStore::new(inner, Duration::from_secs(1), fast_backoff(3));
        let err = store.apply("1", "locator", "new").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }
}
