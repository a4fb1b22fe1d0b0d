//! Database connector and cursor wrappers
//!
//! [`InstrumentedConnector`] counts connection attempts and failures and
//! hands out cursors already wrapped in [`InstrumentedCursor`], which counts
//! and times every statement. Driver errors are counted and returned
//! unchanged.

use crate::clock::TimingToken;
use crate::labels;
use crate::metrics::MetricsRegistry;
use async_trait::async_trait;
use prometheus::{HistogramVec, IntCounterVec};

/// Statement execution against one connection
#[async_trait]
pub trait Cursor: Send {
    /// Bound parameters of one statement execution
    type Params: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Execute a statement once, returning the affected row count
    async fn execute(&mut self, sql: &str, params: &Self::Params) -> Result<u64, Self::Error>;

    /// Execute a statement once per parameter set
    async fn execute_many(
        &mut self,
        sql: &str,
        param_sets: &[Self::Params],
    ) -> Result<u64, Self::Error>;

    /// Label for the `type` of a failed statement
    ///
    /// Defaults to the short name of the error type. Drivers with a single
    /// error enum can override this to report the variant instead.
    fn error_label(_error: &Self::Error) -> String {
        labels::exception_type_name::<Self::Error>().to_string()
    }
}

/// Opens connections to one configured database
#[async_trait]
pub trait Connector: Send + Sync {
    type Cursor: Cursor;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Cursor, Self::Error>;
}

/// Identity of a database connection for metric labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbLabels {
    pub alias: String,
    pub vendor: String,
}

impl DbLabels {
    pub fn new(alias: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            vendor: vendor.into(),
        }
    }
}

/// Database families shared by every connection of a registry
#[derive(Clone)]
pub struct DbMetrics {
    registry: MetricsRegistry,
    new_connections: IntCounterVec,
    new_connection_errors: IntCounterVec,
    execute_total: IntCounterVec,
    execute_many_total: IntCounterVec,
    errors_total: IntCounterVec,
    query_duration: HistogramVec,
}

impl DbMetrics {
    pub fn new(registry: &MetricsRegistry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            new_connections: registry.counter_vec(
                "db_new_connections_total",
                "Counter of created connections by database and by vendor.",
                &["alias", "vendor"],
            )?,
            new_connection_errors: registry.counter_vec(
                "db_new_connection_errors_total",
                "Counter of connection failures by database and by vendor.",
                &["alias", "vendor"],
            )?,
            execute_total: registry.counter_vec(
                "db_execute_total",
                "Counter of executed statements by database and by vendor, including bulk executions.",
                &["alias", "vendor"],
            )?,
            execute_many_total: registry.counter_vec(
                "db_execute_many_total",
                "Counter of executed statements in bulk operations by database and by vendor.",
                &["alias", "vendor"],
            )?,
            errors_total: registry.counter_vec(
                "db_errors_total",
                "Counter of execution errors by database, vendor and exception type.",
                &["alias", "vendor", "type"],
            )?,
            query_duration: registry.histogram_vec(
                "db_query_duration_seconds",
                "Histogram of query duration by database and vendor.",
                &["alias", "vendor"],
                None,
            )?,
            registry: registry.clone(),
        })
    }

    fn inc_by(&self, operation: &str, vec: &IntCounterVec, values: &[&str], by: u64) {
        if let Some(c) = self.registry.labeled(operation, vec, values) {
            c.inc_by(by);
        }
    }

    fn observe_duration(&self, db: &DbLabels, started: TimingToken) {
        if let Some(h) = self.registry.labeled(
            "db_query_duration",
            &self.query_duration,
            &[&db.alias, &db.vendor],
        ) {
            h.observe(started.elapsed_secs());
        }
    }

    fn error(&self, db: &DbLabels, error_type: &str) {
        self.inc_by(
            "db_errors",
            &self.errors_total,
            &[&db.alias, &db.vendor, error_type],
            1,
        );
    }
}

/// Cursor wrapper that counts, times and classifies statement executions
pub struct InstrumentedCursor<C> {
    inner: C,
    db: DbLabels,
    metrics: DbMetrics,
}

impl<C: Cursor> InstrumentedCursor<C> {
    pub fn new(inner: C, db: DbLabels, metrics: DbMetrics) -> Self {
        Self { inner, db, metrics }
    }

    pub fn labels(&self) -> &DbLabels {
        &self.db
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    fn record_failure(&self, error: &C::Error) {
        let error_type = C::error_label(error);
        tracing::debug!(
            alias = %self.db.alias,
            vendor = %self.db.vendor,
            error_type = %error_type,
            error = %error,
            "Statement failed"
        );
        self.metrics.error(&self.db, &error_type);
    }
}

#[async_trait]
impl<C: Cursor> Cursor for InstrumentedCursor<C> {
    type Params = C::Params;
    type Error = C::Error;

    async fn execute(&mut self, sql: &str, params: &C::Params) -> Result<u64, C::Error> {
        self.metrics.inc_by(
            "db_execute",
            &self.metrics.execute_total,
            &[&self.db.alias, &self.db.vendor],
            1,
        );
        let started = TimingToken::now();
        let result = self.inner.execute(sql, params).await;
        self.metrics.observe_duration(&self.db, started);
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    async fn execute_many(
        &mut self,
        sql: &str,
        param_sets: &[C::Params],
    ) -> Result<u64, C::Error> {
        let count = param_sets.len() as u64;
        let db = [self.db.alias.as_str(), self.db.vendor.as_str()];
        self.metrics
            .inc_by("db_execute", &self.metrics.execute_total, &db, count);
        self.metrics
            .inc_by("db_execute_many", &self.metrics.execute_many_total, &db, count);

        let started = TimingToken::now();
        let result = self.inner.execute_many(sql, param_sets).await;
        self.metrics.observe_duration(&self.db, started);
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    fn error_label(error: &C::Error) -> String {
        C::error_label(error)
    }
}

/// Connector wrapper counting connection attempts and failures
pub struct InstrumentedConnector<C> {
    inner: C,
    db: DbLabels,
    metrics: DbMetrics,
}

impl<C: Connector> InstrumentedConnector<C> {
    pub fn new(inner: C, db: DbLabels, metrics: DbMetrics) -> Self {
        Self { inner, db, metrics }
    }

    pub fn labels(&self) -> &DbLabels {
        &self.db
    }
}

#[async_trait]
impl<C: Connector> Connector for InstrumentedConnector<C> {
    type Cursor = InstrumentedCursor<C::Cursor>;
    type Error = C::Error;

    async fn connect(&self) -> Result<Self::Cursor, C::Error> {
        let db = [self.db.alias.as_str(), self.db.vendor.as_str()];
        self.metrics
            .inc_by("db_new_connection", &self.metrics.new_connections, &db, 1);

        match self.inner.connect().await {
            Ok(cursor) => Ok(InstrumentedCursor::new(
                cursor,
                self.db.clone(),
                self.metrics.clone(),
            )),
            Err(e) => {
                tracing::warn!(
                    alias = %self.db.alias,
                    vendor = %self.db.vendor,
                    error = %e,
                    "Database connection failed"
                );
                self.metrics.inc_by(
                    "db_new_connection_error",
                    &self.metrics.new_connection_errors,
                    &db,
                    1,
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::RegistrySnapshot;

    #[derive(Debug, thiserror::Error)]
    enum FakeDbError {
        #[error("syntax error near '{0}'")]
        Syntax(String),
        #[error("connection refused")]
        Refused,
    }

    #[derive(Default)]
    struct FakeCursor {
        statements: Vec<String>,
    }

    #[async_trait]
    impl Cursor for FakeCursor {
        type Params = Vec<i64>;
        type Error = FakeDbError;

        async fn execute(&mut self, sql: &str, _: &Vec<i64>) -> Result<u64, FakeDbError> {
            if sql.starts_with("SELEKT") {
                return Err(FakeDbError::Syntax("SELEKT".into()));
            }
            self.statements.push(sql.to_string());
            Ok(1)
        }

        async fn execute_many(&mut self, sql: &str, sets: &[Vec<i64>]) -> Result<u64, FakeDbError> {
            for set in sets {
                self.execute(sql, set).await?;
            }
            Ok(sets.len() as u64)
        }

        fn error_label(error: &FakeDbError) -> String {
            match error {
                FakeDbError::Syntax(_) => "SyntaxError".into(),
                FakeDbError::Refused => "ConnectionRefused".into(),
            }
        }
    }

    struct FakeConnector {
        up: bool,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Cursor = FakeCursor;
        type Error = FakeDbError;

        async fn connect(&self) -> Result<FakeCursor, FakeDbError> {
            if self.up {
                Ok(FakeCursor::default())
            } else {
                Err(FakeDbError::Refused)
            }
        }
    }

    fn setup() -> (MetricsRegistry, DbMetrics) {
        let registry = MetricsRegistry::new("").unwrap();
        let metrics = DbMetrics::new(&registry).unwrap();
        (registry, metrics)
    }

    const TEST_DB: [(&str, &str); 2] = [("alias", "test_db_1"), ("vendor", "sqlite")];

    #[tokio::test]
    async fn test_execute_counts_and_times() {
        let (registry, metrics) = setup();
        let mut cursor = InstrumentedCursor::new(
            FakeCursor::default(),
            DbLabels::new("test_db_1", "sqlite"),
            metrics,
        );
        let snapshot = RegistrySnapshot::take(&registry);

        cursor.execute("SELECT 1", &vec![]).await.unwrap();
        cursor.execute("SELECT 2", &vec![]).await.unwrap();

        assert_eq!(snapshot.diff(&registry, "db_execute_total", &TEST_DB), 2.0);
        assert_eq!(snapshot.diff(&registry, "db_execute_many_total", &TEST_DB), 0.0);
        assert_eq!(
            snapshot.diff(&registry, "db_query_duration_seconds_count", &TEST_DB),
            2.0
        );
    }

    #[tokio::test]
    async fn test_execute_many_counts_every_parameter_set() {
        let (registry, metrics) = setup();
        let mut cursor = InstrumentedCursor::new(
            FakeCursor::default(),
            DbLabels::new("test_db_1", "sqlite"),
            metrics,
        );
        let snapshot = RegistrySnapshot::take(&registry);

        let sets = vec![vec![1], vec![2], vec![3], vec![4]];
        let rows = cursor.execute_many("INSERT INTO t VALUES (?)", &sets).await.unwrap();

        assert_eq!(rows, 4);
        assert_eq!(snapshot.diff(&registry, "db_execute_total", &TEST_DB), 4.0);
        assert_eq!(snapshot.diff(&registry, "db_execute_many_total", &TEST_DB), 4.0);
        assert_eq!(cursor.into_inner().statements.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_statement_is_counted_and_propagated() {
        let (registry, metrics) = setup();
        let mut cursor = InstrumentedCursor::new(
            FakeCursor::default(),
            DbLabels::new("test_db_1", "sqlite"),
            metrics,
        );
        let snapshot = RegistrySnapshot::take(&registry);

        let result = cursor.execute("SELEKT 1", &vec![]).await;

        assert!(matches!(result, Err(FakeDbError::Syntax(_))));
        assert_eq!(
            snapshot.diff(
                &registry,
                "db_errors_total",
                &[("alias", "test_db_1"), ("vendor", "sqlite"), ("type", "SyntaxError")]
            ),
            1.0
        );
        assert_eq!(
            snapshot.diff(&registry, "db_query_duration_seconds_count", &TEST_DB),
            1.0
        );
    }

    #[tokio::test]
    async fn test_connector_wraps_cursors() {
        let (registry, metrics) = setup();
        let connector = InstrumentedConnector::new(
            FakeConnector { up: true },
            DbLabels::new("test_db_1", "sqlite"),
            metrics,
        );
        let snapshot = RegistrySnapshot::take(&registry);

        let mut cursor = connector.connect().await.unwrap();
        cursor.execute("SELECT 1", &vec![]).await.unwrap();

        assert_eq!(snapshot.diff(&registry, "db_new_connections_total", &TEST_DB), 1.0);
        assert_eq!(snapshot.diff(&registry, "db_execute_total", &TEST_DB), 1.0);
        assert_eq!(cursor.labels().alias, "test_db_1");
    }

    #[tokio::test]
    async fn test_connection_failure_is_counted_and_propagated() {
        let (registry, metrics) = setup();
        let connector = InstrumentedConnector::new(
            FakeConnector { up: false },
            DbLabels::new("test_db_1", "sqlite"),
            metrics,
        );
        let snapshot = RegistrySnapshot::take(&registry);

        assert!(connector.connect().await.is_err());
        assert_eq!(snapshot.diff(&registry, "db_new_connections_total", &TEST_DB), 1.0);
        assert_eq!(
            snapshot.diff(&registry, "db_new_connection_errors_total", &TEST_DB),
            1.0
        );
    }

    #[test]
    fn test_default_error_label_is_type_name() {
        struct PlainCursor;

        #[async_trait]
        impl Cursor for PlainCursor {
            type Params = ();
            type Error = std::io::Error;

            async fn execute(&mut self, _: &str, _: &()) -> Result<u64, std::io::Error> {
                Ok(0)
            }

            async fn execute_many(&mut self, _: &str, _: &[()]) -> Result<u64, std::io::Error> {
                Ok(0)
            }
        }

        let err = std::io::Error::other("boom");
        assert_eq!(PlainCursor::error_label(&err), "Error");
    }
}
