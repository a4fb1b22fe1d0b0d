//! Cache backends with hit/miss/failure accounting
//!
//! [`InstrumentedCache`] wraps any [`CacheBackend`] and counts every `get`
//! under the configured `backend` label. `set` and `delete` are delegated
//! untouched.

use crate::error::CacheError;
use crate::metrics::MetricsRegistry;
use async_trait::async_trait;
use prometheus::IntCounterVec;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Version used when a caller does not pass one
pub const DEFAULT_VERSION: u32 = 1;

/// Key/value cache with optional key versions
///
/// Values stored under one version are invisible under any other version.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    type Value: Clone + Send + Sync + 'static;

    /// Fetch a value, `Ok(None)` on a miss
    async fn get(&self, key: &str, version: Option<u32>) -> Result<Option<Self::Value>, CacheError>;

    /// Store a value, optionally expiring after `ttl`
    async fn set(
        &self,
        key: &str,
        value: Self::Value,
        ttl: Option<Duration>,
        version: Option<u32>,
    ) -> Result<(), CacheError>;

    /// Remove a value, returning whether it existed
    async fn delete(&self, key: &str, version: Option<u32>) -> Result<bool, CacheError>;
}

/// In-process cache backend
///
/// Entries are keyed as `:{version}:{key}` and expire lazily on read.
pub struct LocMemCache<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> LocMemCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Storage key for `key` under `version`
    pub fn make_key(key: &str, version: Option<u32>) -> String {
        format!(":{}:{}", version.unwrap_or(DEFAULT_VERSION), key)
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry<V>>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Backend("cache lock poisoned".to_string()))
    }
}

impl<V> Default for LocMemCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> CacheBackend for LocMemCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    type Value = V;

    async fn get(&self, key: &str, version: Option<u32>) -> Result<Option<V>, CacheError> {
        let storage_key = Self::make_key(key, version);
        let mut entries = self.lock()?;
        let expired = match entries.get(&storage_key) {
            Some(entry) => entry
                .expires_at
                .map(|deadline| Instant::now() >= deadline)
                .unwrap_or(false),
            None => return Ok(None),
        };
        if expired {
            entries.remove(&storage_key);
            return Ok(None);
        }
        Ok(entries.get(&storage_key).map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: V,
        ttl: Option<Duration>,
        version: Option<u32>,
    ) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.lock()?
            .insert(Self::make_key(key, version), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str, version: Option<u32>) -> Result<bool, CacheError> {
        Ok(self.lock()?.remove(&Self::make_key(key, version)).is_some())
    }
}

/// Cache families shared by every instrumented cache of a registry
#[derive(Clone)]
pub struct CacheMetrics {
    registry: MetricsRegistry,
    get_total: IntCounterVec,
    hits: IntCounterVec,
    misses: IntCounterVec,
    fail: IntCounterVec,
}

impl CacheMetrics {
    pub fn new(registry: &MetricsRegistry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            get_total: registry.counter_vec(
                "cache_get_total",
                "Total get requests on cache",
                &["backend"],
            )?,
            hits: registry.counter_vec(
                "cache_get_hits_total",
                "Total hits on cache",
                &["backend"],
            )?,
            misses: registry.counter_vec(
                "cache_get_misses_total",
                "Total misses on cache",
                &["backend"],
            )?,
            fail: registry.counter_vec(
                "cache_get_fail_total",
                "Total get request failures by cache",
                &["backend"],
            )?,
            registry: registry.clone(),
        })
    }

    fn inc(&self, operation: &str, vec: &IntCounterVec, backend: &str) {
        if let Some(c) = self.registry.labeled(operation, vec, &[backend]) {
            c.inc();
        }
    }

    /// Create the zero-valued series for `backend`
    fn touch(&self, backend: &str) {
        for (operation, vec) in [
            ("cache_get", &self.get_total),
            ("cache_hit", &self.hits),
            ("cache_miss", &self.misses),
            ("cache_fail", &self.fail),
        ] {
            let _ = self.registry.labeled(operation, vec, &[backend]);
        }
    }
}

/// Failure policy of an instrumented cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Return the default instead of propagating transient failures
    pub ignore_exceptions: bool,
    /// Log ignored failures at error level
    pub log_ignored_exceptions: bool,
}

/// Cache wrapper that counts gets, hits, misses and failures
pub struct InstrumentedCache<C> {
    inner: C,
    backend: String,
    metrics: CacheMetrics,
    policy: FailurePolicy,
}

impl<C: CacheBackend> InstrumentedCache<C> {
    pub fn new(inner: C, backend: impl Into<String>, metrics: CacheMetrics) -> Self {
        let backend = backend.into();
        metrics.touch(&backend);
        Self {
            inner,
            backend,
            metrics,
            policy: FailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Backend label of this cache
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Fetch `key`, returning `default` on a miss
    ///
    /// `cache_get_total` is incremented exactly once per call, followed by
    /// exactly one of hits, misses or failures.
    ///
    /// # Errors
    ///
    /// Returns the backend error unless it is transient and the cache ignores
    /// exceptions, in which case `default` is returned.
    pub async fn get_with_default(
        &self,
        key: &str,
        default: Option<C::Value>,
        version: Option<u32>,
    ) -> Result<Option<C::Value>, CacheError> {
        self.metrics
            .inc("cache_get", &self.metrics.get_total, &self.backend);

        match self.inner.get(key, version).await {
            Ok(Some(value)) => {
                self.metrics.inc("cache_hit", &self.metrics.hits, &self.backend);
                Ok(Some(value))
            }
            Ok(None) => {
                self.metrics
                    .inc("cache_miss", &self.metrics.misses, &self.backend);
                Ok(default)
            }
            Err(e) => {
                self.metrics.inc("cache_fail", &self.metrics.fail, &self.backend);
                if e.is_transient() && self.policy.ignore_exceptions {
                    if self.policy.log_ignored_exceptions {
                        tracing::error!(
                            backend = %self.backend,
                            key,
                            error = %e,
                            "Ignoring cache failure, returning default"
                        );
                    }
                    Ok(default)
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[async_trait]
impl<C: CacheBackend> CacheBackend for InstrumentedCache<C> {
    type Value = C::Value;

    async fn get(&self, key: &str, version: Option<u32>) -> Result<Option<C::Value>, CacheError> {
        self.get_with_default(key, None, version).await
    }

    async fn set(
        &self,
        key: &str,
        value: C::Value,
        ttl: Option<Duration>,
        version: Option<u32>,
    ) -> Result<(), CacheError> {
        self.inner.set(key, value, ttl, version).await
    }

    async fn delete(&self, key: &str, version: Option<u32>) -> Result<bool, CacheError> {
        self.inner.delete(key, version).await
    }
}
