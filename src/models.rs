//! Model store wrapper counting inserts, updates and deletes
//!
//! Counts are taken on attempt, before the inner store runs, so a failed
//! write is still counted once.

use crate::metrics::MetricsRegistry;
use async_trait::async_trait;
use prometheus::IntCounterVec;

/// Persistence operations for one model
#[async_trait]
pub trait ModelStore: Send + Sync {
    type Key: Send + Sync;
    type Record: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn insert(&self, record: Self::Record) -> Result<Self::Key, Self::Error>;

    /// Replace the record at `key`, returning whether it existed
    async fn update(&self, key: &Self::Key, record: Self::Record) -> Result<bool, Self::Error>;

    /// Remove the record at `key`, returning whether it existed
    async fn delete(&self, key: &Self::Key) -> Result<bool, Self::Error>;
}

/// Model families shared by every instrumented store of a registry
#[derive(Clone)]
pub struct ModelMetrics {
    registry: MetricsRegistry,
    inserts: IntCounterVec,
    updates: IntCounterVec,
    deletes: IntCounterVec,
}

impl ModelMetrics {
    pub fn new(registry: &MetricsRegistry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            inserts: registry.counter_vec(
                "model_inserts_total",
                "Number of insert operations by model.",
                &["model"],
            )?,
            updates: registry.counter_vec(
                "model_updates_total",
                "Number of update operations by model.",
                &["model"],
            )?,
            deletes: registry.counter_vec(
                "model_deletes_total",
                "Number of delete operations by model.",
                &["model"],
            )?,
            registry: registry.clone(),
        })
    }

    /// Create zero-valued series for `model` so scrapes show it before any write
    pub fn register_model(&self, model: &str) {
        for (operation, vec) in [
            ("model_insert", &self.inserts),
            ("model_update", &self.updates),
            ("model_delete", &self.deletes),
        ] {
            let _ = self.registry.labeled(operation, vec, &[model]);
        }
    }

    fn inc(&self, operation: &str, vec: &IntCounterVec, model: &str) {
        if let Some(c) = self.registry.labeled(operation, vec, &[model]) {
            c.inc();
        }
    }
}

/// Store wrapper counting writes under the `model` label
pub struct InstrumentedModelStore<S> {
    inner: S,
    model: String,
    metrics: ModelMetrics,
}

impl<S: ModelStore> InstrumentedModelStore<S> {
    pub fn new(inner: S, model: impl Into<String>, metrics: ModelMetrics) -> Self {
        let model = model.into();
        metrics.register_model(&model);
        Self {
            inner,
            model,
            metrics,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ModelStore> ModelStore for InstrumentedModelStore<S> {
    type Key = S::Key;
    type Record = S::Record;
    type Error = S::Error;

    async fn insert(&self, record: S::Record) -> Result<S::Key, S::Error> {
        self.metrics
            .inc("model_insert", &self.metrics.inserts, &self.model);
        self.inner.insert(record).await
    }

    async fn update(&self, key: &S::Key, record: S::Record) -> Result<bool, S::Error> {
        self.metrics
            .inc("model_update", &self.metrics.updates, &self.model);
        self.inner.update(key, record).await
    }

    async fn delete(&self, key: &S::Key) -> Result<bool, S::Error> {
        self.metrics
            .inc("model_delete", &self.metrics.deletes, &self.model);
        self.inner.delete(key).await
    }
}
