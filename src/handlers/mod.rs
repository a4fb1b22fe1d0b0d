//! Application state and HTTP handlers for the metrics endpoint

use crate::auth::MetricsAuth;
use crate::cache::{CacheBackend, CacheMetrics, FailurePolicy, InstrumentedCache};
use crate::config::Config;
use crate::db::{Connector, DbLabels, DbMetrics, InstrumentedConnector};
use crate::error::{AppError, AppResult};
use crate::metrics::{HttpMetrics, MetricsRegistry};
use crate::middleware::{LabelExtender, MetricsLayers};
use crate::migrations::{MigrationGauges, MigrationSource};
use crate::models::{InstrumentedModelStore, ModelMetrics, ModelStore};
use crate::multiprocess::{ShardFlusher, WorkerIdentity, WorkerShard, aggregate_shards, write_shard};
use crate::tasks::TaskMetrics;
use axum::{Router, routing::get};
use std::sync::Arc;
use std::time::Duration;

pub mod metrics;

/// Application state shared across all handlers
///
/// Owns the registry and every metrics bundle built from the configuration.
/// All fields are cheap to clone: clones share the same registry.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    registry: MetricsRegistry,
    http: HttpMetrics,
    cache: CacheMetrics,
    db: DbMetrics,
    models: ModelMetrics,
    migrations: MigrationGauges,
    tasks: Option<TaskMetrics>,
    auth: Arc<MetricsAuth>,
    shard: Option<Arc<WorkerShard>>,
    extender: Option<Arc<dyn LabelExtender>>,
}

impl AppState {
    /// Build the registry and every metrics bundle from `config`
    ///
    /// In multi-process mode the registry is stamped with the worker label
    /// and the worker's shard is prepared.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric family cannot be registered or the shard
    /// directory cannot be created.
    pub fn new(config: Arc<Config>) -> AppResult<Self> {
        Self::build(config, None)
    }

    /// Like [`AppState::new`], with extra labels on chosen HTTP families
    ///
    /// The layers returned by [`AppState::layers`] ask `extender` for the
    /// label values of every recording.
    pub fn with_label_extender(
        config: Arc<Config>,
        extender: Arc<dyn LabelExtender>,
    ) -> AppResult<Self> {
        Self::build(config, Some(extender))
    }

    fn build(config: Arc<Config>, extender: Option<Arc<dyn LabelExtender>>) -> AppResult<Self> {
        let namespace = config.metrics.namespace.as_str();
        let (registry, shard) = match &config.multiprocess {
            Some(mp) => {
                let identity = WorkerIdentity::resolve(mp.worker_id.as_deref());
                let registry = MetricsRegistry::with_const_labels(namespace, identity.const_labels())?;
                let shard = WorkerShard::create(mp.dir.clone(), identity)?;
                (registry, Some(Arc::new(shard)))
            }
            None => (MetricsRegistry::new(namespace)?, None),
        };

        let extra_names = extender
            .as_ref()
            .map(|extender| extender.label_names())
            .unwrap_or_default();
        let http = HttpMetrics::with_extra_labels(
            &registry,
            config.metrics.latency_buckets.clone(),
            &extra_names,
        )?;
        let cache = CacheMetrics::new(&registry)?;
        let db = DbMetrics::new(&registry)?;
        let models = ModelMetrics::new(&registry)?;
        for model in &config.models {
            models.register_model(&model.name);
        }
        let migrations = MigrationGauges::new(&registry)?;
        // Task metrics are pushed, not scraped: they get a registry of their own
        let tasks = if config.tasks.enabled {
            Some(TaskMetrics::new(&MetricsRegistry::new(namespace)?)?)
        } else {
            None
        };
        let auth = Arc::new(MetricsAuth::from_config(config.export.auth.as_ref()));

        tracing::info!(
            namespace = %config.metrics.namespace,
            models = config.models.len(),
            databases = config.databases.len(),
            caches = config.caches.len(),
            multiprocess = shard.is_some(),
            extended_families = extra_names.len(),
            auth_enabled = !auth.is_open(),
            "Metrics registry initialized"
        );

        Ok(Self {
            config,
            registry,
            http,
            cache,
            db,
            models,
            migrations,
            tasks,
            auth,
            shard,
            extender,
        })
    }

    /// Get reference to the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn http(&self) -> &HttpMetrics {
        &self.http
    }

    pub fn auth(&self) -> &MetricsAuth {
        &self.auth
    }

    pub fn migrations(&self) -> &MigrationGauges {
        &self.migrations
    }

    /// Task metrics, when `[tasks] enabled = true`
    pub fn tasks(&self) -> Option<&TaskMetrics> {
        self.tasks.as_ref()
    }

    pub fn shard(&self) -> Option<&WorkerShard> {
        self.shard.as_deref()
    }

    /// Middleware pair for the host router
    pub fn layers(&self) -> MetricsLayers {
        let trust_forwarded_proto = self.config.metrics.trust_forwarded_proto;
        match &self.extender {
            Some(extender) => MetricsLayers::with_extender(
                self.http.clone(),
                trust_forwarded_proto,
                Arc::clone(extender),
            ),
            None => MetricsLayers::new(self.http.clone(), trust_forwarded_proto),
        }
    }

    /// Wrap a cache backend, labeled and configured from `[[caches]]`
    ///
    /// An unconfigured cache is labeled with its name and propagates every
    /// failure.
    pub fn instrument_cache<C: CacheBackend>(&self, name: &str, inner: C) -> InstrumentedCache<C> {
        match self.config.cache(name) {
            Some(cache) => InstrumentedCache::new(inner, cache.backend_label(), self.cache.clone())
                .with_policy(FailurePolicy {
                    ignore_exceptions: cache.ignore_exceptions,
                    log_ignored_exceptions: cache.log_ignored_exceptions,
                }),
            None => InstrumentedCache::new(inner, name, self.cache.clone()),
        }
    }

    /// Wrap a database connector configured under `[[databases]]`
    ///
    /// # Errors
    ///
    /// Returns an error if `alias` is not configured.
    pub fn instrument_connector<C: Connector>(
        &self,
        alias: &str,
        inner: C,
    ) -> AppResult<InstrumentedConnector<C>> {
        let db = self.config.database(alias).ok_or_else(|| {
            AppError::Config(format!("Database alias '{}' is not configured", alias))
        })?;
        Ok(InstrumentedConnector::new(
            inner,
            DbLabels::new(db.alias.clone(), db.vendor.clone()),
            self.db.clone(),
        ))
    }

    /// Wrap a model store under the `model` label
    pub fn instrument_model<S: ModelStore>(&self, model: &str, inner: S) -> InstrumentedModelStore<S> {
        InstrumentedModelStore::new(inner, model, self.models.clone())
    }

    /// Export migration gauges for `alias` from `source`
    ///
    /// Sources are only consulted when `[migrations] enabled` is set.
    pub fn add_migration_source(&self, alias: &str, source: Arc<dyn MigrationSource>) {
        self.migrations.add_source(alias, source);
    }

    /// Refresh migration gauges when enabled
    pub fn export_migrations(&self) -> usize {
        if self.config.migrations.enabled {
            self.migrations.export()
        } else {
            0
        }
    }

    /// Write this worker's shard, if multi-process mode is on
    pub fn flush_shard(&self) -> AppResult<()> {
        if let Some(shard) = &self.shard {
            write_shard(shard, &self.registry)?;
        }
        Ok(())
    }

    /// Keep this worker's shard current in the background
    ///
    /// Returns `None` outside multi-process mode. Must be called from within
    /// a tokio runtime; stop it with [`ShardFlusher::shutdown`] before
    /// cleaning up the shard.
    pub fn start_shard_flusher(&self) -> Option<ShardFlusher> {
        let shard = self.shard.as_ref()?;
        let every = self
            .config
            .multiprocess
            .as_ref()
            .map(|mp| Duration::from_millis(mp.flush_interval_ms))?;
        Some(ShardFlusher::spawn(
            Arc::clone(shard),
            self.registry.clone(),
            every,
        ))
    }

    /// Exposition text served by the metrics endpoint
    ///
    /// In multi-process mode the local shard is flushed first and the merge
    /// of every worker's shard is returned.
    pub fn render(&self) -> AppResult<String> {
        match &self.shard {
            Some(shard) => {
                self.flush_shard()?;
                Ok(aggregate_shards(shard.dir())?)
            }
            None => Ok(self.registry.gather()?),
        }
    }
}

/// Router serving the metrics endpoint at the configured path
pub fn router(state: AppState) -> Router {
    let path = state.config().export.path.clone();
    Router::new()
        .route(&path, get(metrics::handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocMemCache;
    use crate::migrations::MigrationState;
    use crate::testutils::sample_value;
    use std::str::FromStr;

    fn create_test_config() -> Config {
        Config::from_str(
            r#"
[[models]]
name = "dog"

[[databases]]
alias = "default"
vendor = "sqlite"

[[caches]]
name = "default"
backend = "locmem"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_appstate_new_creates_state() {
        let state = AppState::new(Arc::new(create_test_config())).unwrap();
        assert_eq!(state.config().models.len(), 1);
        assert!(state.tasks().is_none());
        assert!(state.shard().is_none());
        assert!(state.auth().is_open());
        assert_eq!(
            sample_value(state.registry(), "model_inserts_total", &[("model", "dog")]),
            Some(0.0)
        );
    }

    #[test]
    fn test_appstate_is_clonable() {
        let state = AppState::new(Arc::new(create_test_config())).unwrap();
        let state2 = state.clone();
        state.registry().counter("shared_total", "Shared").unwrap().inc();
        assert!(state2.registry().gather().unwrap().contains("shared_total 1"));
    }

    #[test]
    fn test_instrument_cache_uses_configured_label() {
        let state = AppState::new(Arc::new(create_test_config())).unwrap();
        let configured = state.instrument_cache("default", LocMemCache::<u8>::new());
        let unconfigured = state.instrument_cache("sessions", LocMemCache::<u8>::new());
        assert_eq!(configured.backend(), "locmem");
        assert_eq!(unconfigured.backend(), "sessions");
    }

    #[test]
    fn test_export_migrations_respects_flag() {
        let mut config = create_test_config();
        let state = AppState::new(Arc::new(config.clone())).unwrap();
        state.add_migration_source("default", Arc::new(MigrationState::new("default", ["a"], ["a"])));
        assert_eq!(state.export_migrations(), 1);

        config.migrations.enabled = false;
        let disabled = AppState::new(Arc::new(config)).unwrap();
        disabled.add_migration_source("default", Arc::new(MigrationState::new("default", ["a"], ["a"])));
        assert_eq!(disabled.export_migrations(), 0);
    }

    #[test]
    fn test_tasks_enabled_registers_task_metrics() {
        let mut config = create_test_config();
        config.tasks.enabled = true;
        let state = AppState::new(Arc::new(config)).unwrap();
        let tasks = state.tasks().expect("tasks are enabled");

        tasks.started("resize");
        state.http().after_request("GET", "http", false, 0, &Default::default());

        let pushed = tasks.registry().gather().unwrap();
        assert!(pushed.contains("tasks_started_total{task=\"resize\"} 1"));
        assert!(!pushed.contains("http_requests_total_by_method"));
        assert!(!state.registry().gather().unwrap().contains("tasks_started_total"));
    }
}
