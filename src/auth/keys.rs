use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, LLMError};

/// Consecutive failures after which a key is considered unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Health bookkeeping for one configured API key.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub key: String,
    /// Position in the configured order, starting at zero.
    pub ordinal: usize,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub success_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub healthy: bool,
}

impl ApiKeyRecord {
    fn new(key: String, ordinal: usize) -> Self {
        Self {
            key,
            ordinal,
            consecutive_failures: 0,
            total_failures: 0,
            success_count: 0,
            last_used: None,
            last_error: None,
            healthy: true,
        }
    }
}

impl fmt::Debug for ApiKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyRecord")
            .field("key", &"<redacted>")
            .field("ordinal", &self.ordinal)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("total_failures", &self.total_failures)
            .field("success_count", &self.success_count)
            .field("last_used", &self.last_used)
            .field("last_error", &self.last_error)
            .field("healthy", &self.healthy)
            .finish()
    }
}

/// Ordered set of API keys with per-key health tracking.
///
/// Keys are tried healthy-first in configured order. Auth failures quarantine a key
/// until [`ApiKeyPool::reset`]; other failures only quarantine it once
/// [`DEFAULT_FAILURE_THRESHOLD`] consecutive failures accumulate.
pub struct ApiKeyPool {
    provider: String,
    threshold: u32,
    records: RwLock<Vec<ApiKeyRecord>>,
}

impl ApiKeyPool {
    pub fn new(provider: impl Into<String>, keys: impl IntoIterator<Item = String>) -> Self {
        let records = keys
            .into_iter()
            .enumerate()
            .map(|(ordinal, key)| ApiKeyRecord::new(key, ordinal))
            .collect();
        Self {
            provider: provider.into(),
            threshold: DEFAULT_FAILURE_THRESHOLD,
            records: RwLock::new(records),
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    /// Keys in their original order.
    pub async fn keys(&self) -> Vec<String> {
        self.records
            .read()
            .await
            .iter()
            .map(|record| record.key.clone())
            .collect()
    }

    /// Snapshot of every record.
    pub async fn records(&self) -> Vec<ApiKeyRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn healthy_count(&self) -> usize {
        self.records
            .read()
            .await
            .iter()
            .filter(|record| record.healthy)
            .count()
    }

    pub async fn report_success(&self, key: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|record| record.key == key) {
            Self::mark_success(record);
        }
    }

    pub async fn report_failure(&self, key: &str, kind: ErrorKind) {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|record| record.key == key) {
            Self::mark_failure(record, kind, self.threshold, &self.provider);
        }
    }

    /// Restores every key to a healthy state and clears the counters.
    pub async fn reset(&self) {
        let mut records = self.records.write().await;
        for record in records.iter_mut() {
            *record = ApiKeyRecord::new(std::mem::take(&mut record.key), record.ordinal);
        }
    }

    /// Drops every key.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }

    /// Runs `op` with each key until one succeeds.
    ///
    /// Healthy keys go first, then quarantined ones, each in configured order. The first
    /// success is returned without touching later keys. When every key fails the last
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::NoCredentials`] for an empty pool without calling `op`, and
    /// [`LLMError::Aborted`] as soon as `cancel` fires. Errors for which
    /// [`LLMError::stops_failover`] holds are returned at once and leave the key's
    /// health untouched.
    pub async fn execute_with_failover<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, LLMError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, LLMError>>,
    {
        let order = self.attempt_order().await;
        if order.is_empty() {
            return Err(LLMError::NoCredentials {
                provider: format!("{} (no keys configured)", self.provider),
            });
        }

        let mut last_error = None;
        for (ordinal, key) in order {
            if cancel.is_cancelled() {
                return Err(LLMError::aborted("cancelled during key failover"));
            }
            debug!(provider = %self.provider, key_index = ordinal, "trying api key");
            match op(key).await {
                Ok(value) => {
                    self.update(ordinal, |record, _, _| Self::mark_success(record))
                        .await;
                    return Ok(value);
                }
                Err(err) if err.stops_failover() => {
                    debug!(provider = %self.provider, key_index = ordinal, error = %err, "request rejected, not failing over");
                    return Err(err);
                }
                Err(err) => {
                    let kind = err.kind();
                    warn!(
                        provider = %self.provider,
                        key_index = ordinal,
                        error = %err,
                        "api key failed, trying next"
                    );
                    self.update(ordinal, |record, threshold, provider| {
                        Self::mark_failure(record, kind, threshold, provider)
                    })
                    .await;
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LLMError::NoCredentials {
            provider: self.provider.clone(),
        }))
    }

    async fn attempt_order(&self) -> Vec<(usize, String)> {
        let records = self.records.read().await;
        let healthy = records.iter().filter(|record| record.healthy);
        let quarantined = records.iter().filter(|record| !record.healthy);
        healthy
            .chain(quarantined)
            .map(|record| (record.ordinal, record.key.clone()))
            .collect()
    }

    async fn update(&self, ordinal: usize, apply: impl FnOnce(&mut ApiKeyRecord, u32, &str)) {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|record| record.ordinal == ordinal) {
            apply(record, self.threshold, &self.provider);
        }
    }

    fn mark_success(record: &mut ApiKeyRecord) {
        record.success_count += 1;
        record.consecutive_failures = 0;
        record.healthy = true;
        record.last_used = Some(Utc::now());
    }

    fn mark_failure(record: &mut ApiKeyRecord, kind: ErrorKind, threshold: u32, provider: &str) {
        let now = Utc::now();
        record.consecutive_failures += 1;
        record.total_failures += 1;
        record.last_used = Some(now);
        record.last_error = Some(now);
        if kind == ErrorKind::Auth || record.consecutive_failures >= threshold {
            if record.healthy {
                warn!(
                    provider,
                    key_index = record.ordinal,
                    kind = %kind,
                    consecutive_failures = record.consecutive_failures,
                    "quarantining api key"
                );
            }
            record.healthy = false;
        }
    }
}

impl fmt::Debug for ApiKeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyPool")
            .field("provider", &self.provider)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}
