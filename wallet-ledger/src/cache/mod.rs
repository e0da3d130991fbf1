//! Read-through cache
//!
//! The cache is advisory: a failed read is a miss, a failed write or delete
//! is logged and dropped. Nothing here ever reaches the caller as an error.

use crate::metrics;
use crate::models::{AccountId, Page, TransactionFilter, UserId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// Raw key/value store with per-entry expiry
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;
}

/// Cache key layout
pub mod keys {
    use super::*;

    pub const BALANCE: &str = "wallet:balance";
    pub const ACCOUNT_BY_USER: &str = "wallet:user";
    pub const HISTORY: &str = "txhistory:account";
    pub const LEDGER_LISTING: &str = "admin:txs";

    pub fn balance(account_id: AccountId) -> String {
        format!("{}:{}", BALANCE, account_id)
    }

    pub fn account_by_user(user_id: UserId) -> String {
        format!("{}:{}", ACCOUNT_BY_USER, user_id)
    }

    pub fn history(account_id: AccountId, page: Page) -> String {
        format!(
            "{}:{}:page:{}:size:{}",
            HISTORY, account_id, page.page, page.page_size
        )
    }

    /// The first `pages` pages for each page size. Deeper pages are left to expire.
    pub fn history_prefix(account_id: AccountId, pages: u32, page_sizes: &[u32]) -> Vec<String> {
        page_sizes
            .iter()
            .flat_map(|&page_size| {
                (1..=pages).map(move |page| history(account_id, Page { page, page_size }))
            })
            .collect()
    }

    pub fn ledger_listing(filter: &TransactionFilter, page: Page) -> String {
        fn part<T: ToString>(value: Option<T>) -> String {
            value.map(|v| v.to_string()).unwrap_or_default()
        }

        format!(
            "{}:account={}:kind={}:from={}:to={}:page={}:size={}",
            LEDGER_LISTING,
            part(filter.account),
            part(filter.kind),
            part(filter.from.map(|t| t.timestamp_micros())),
            part(filter.to.map(|t| t.timestamp_micros())),
            page.page,
            page.page_size
        )
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64) / (total as f64) * 100.0
        }
    }
}

/// Typed JSON view over a [`CacheBackend`]
///
/// Every invalidation advances a process-wide epoch. A fill that observed an
/// older epoch before loading is dropped, so a load racing a mutation cannot
/// repopulate the value the mutation just invalidated.
#[derive(Clone)]
pub struct LedgerCache {
    backend: Arc<dyn CacheBackend>,
    metrics: Arc<RwLock<CacheMetrics>>,
    epoch: Arc<AtomicU64>,
}

impl LedgerCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        LedgerCache {
            backend,
            metrics: Arc::new(RwLock::new(CacheMetrics::default())),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    /// Any failure is reported as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => {
                    self.record_hit().await;
                    Some(value)
                }
                Err(e) => {
                    warn!(key, error = %e, "Discarding undecodable cache entry");
                    self.record_error("decode").await;
                    self.record_miss().await;
                    None
                }
            },
            Ok(None) => {
                self.record_miss().await;
                None
            }
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, falling back to store");
                self.record_error("get").await;
                self.record_miss().await;
                None
            }
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode cache entry");
                self.record_error("encode").await;
                return;
            }
        };

        match self.backend.set(key, json, ttl).await {
            Ok(()) => self.record_set().await,
            Err(e) => {
                warn!(key, error = %e, "Cache write failed");
                self.record_error("set").await;
            }
        }
    }

    /// Capture before loading a value that will be passed to [`Self::put_json_if_current`].
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Write `value` only if no invalidation has started since `observed`.
    pub async fn put_json_if_current<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        observed: u64,
    ) {
        if self.epoch() != observed {
            debug!(key, "Skipping cache fill raced by invalidation");
            return;
        }

        self.put_json(key, value, ttl).await;

        // An invalidation that started during the write may have deleted
        // before the write landed
        if self.epoch() != observed {
            debug!(key, "Dropping cache fill raced by invalidation");
            if let Err(e) = self.backend.delete(&[key.to_string()]).await {
                warn!(key, error = %e, "Cache invalidation failed");
                self.record_error("delete").await;
            }
        }
    }

    /// Best effort. A failure leaves stale entries that expire with their TTL.
    pub async fn invalidate(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }

        // Advance before deleting so in-flight fills see the change
        self.epoch.fetch_add(1, Ordering::SeqCst);

        match self.backend.delete(keys).await {
            Ok(()) => {
                debug!(count = keys.len(), "Invalidated cache entries");
                self.record_delete(keys.len() as u64).await;
            }
            Err(e) => {
                warn!(count = keys.len(), error = %e, "Cache invalidation failed");
                self.record_error("delete").await;
            }
        }
    }

    async fn record_hit(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.hits += 1;
        metrics::CACHE_HITS.inc();
    }

    async fn record_miss(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.misses += 1;
        metrics::CACHE_MISSES.inc();
    }

    async fn record_set(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.sets += 1;
    }

    async fn record_delete(&self, count: u64) {
        let mut metrics = self.metrics.write().await;
        metrics.deletes += count;
    }

    async fn record_error(&self, op: &str) {
        let mut metrics = self.metrics.write().await;
        metrics.errors += 1;
        metrics::CACHE_ERRORS.with_label_values(&[op]).inc();
    }

    /// Get current cache metrics
    pub async fn get_metrics(&self) -> CacheMetrics {
        self.metrics.read().await.clone()
    }

    /// Reset cache metrics
    pub async fn reset_metrics(&self) {
        let mut metrics = self.metrics.write().await;
        *metrics = CacheMetrics::default();
    }
}
