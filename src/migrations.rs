//! Applied/unapplied migration gauges per database connection
//!
//! Gauges are set, never incremented, so exporting twice reports the same
//! numbers. A source that cannot be read keeps its previous values.

use crate::error::MigrationError;
use crate::metrics::MetricsRegistry;
use prometheus::IntGaugeVec;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// Migration state of one database connection
pub trait MigrationSource: Send + Sync {
    /// Number of migrations recorded as applied
    fn applied_count(&self) -> Result<usize, MigrationError>;

    /// Length of the plan that would bring the database up to date
    fn unapplied_count(&self) -> Result<usize, MigrationError>;
}

/// In-memory migration state: every known migration and the applied subset
#[derive(Debug, Clone, Default)]
pub struct MigrationState {
    alias: String,
    known: Vec<String>,
    applied: BTreeSet<String>,
}

impl MigrationState {
    pub fn new<K, A>(alias: impl Into<String>, known: K, applied: A) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            alias: alias.into(),
            known: known.into_iter().map(Into::into).collect(),
            applied: applied.into_iter().map(Into::into).collect(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Record `name` as applied
    pub fn apply(&mut self, name: impl Into<String>) {
        self.applied.insert(name.into());
    }

    fn check(&self) -> Result<(), MigrationError> {
        match self
            .applied
            .iter()
            .find(|name| !self.known.iter().any(|known| known == *name))
        {
            Some(unknown) => Err(MigrationError::Inconsistent {
                alias: self.alias.clone(),
                reason: format!("applied migration '{}' is not known", unknown),
            }),
            None => Ok(()),
        }
    }
}

impl MigrationSource for MigrationState {
    fn applied_count(&self) -> Result<usize, MigrationError> {
        self.check()?;
        Ok(self.applied.len())
    }

    fn unapplied_count(&self) -> Result<usize, MigrationError> {
        self.check()?;
        Ok(self
            .known
            .iter()
            .filter(|name| !self.applied.contains(*name))
            .count())
    }
}

type Sources = Vec<(String, Arc<dyn MigrationSource>)>;

/// Gauges for every registered connection
///
/// Clones share the same set of sources.
#[derive(Clone)]
pub struct MigrationGauges {
    applied: IntGaugeVec,
    unapplied: IntGaugeVec,
    sources: Arc<RwLock<Sources>>,
}

impl MigrationGauges {
    pub fn new(registry: &MetricsRegistry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            applied: registry.gauge_vec(
                "migrations_applied_total",
                "Count of applied migrations by database connection",
                &["connection"],
            )?,
            unapplied: registry.gauge_vec(
                "migrations_unapplied_total",
                "Count of unapplied migrations by database connection",
                &["connection"],
            )?,
            sources: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Track `source` under the `connection` label `alias`
    pub fn add_source(&self, alias: impl Into<String>, source: Arc<dyn MigrationSource>) {
        self.sources
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((alias.into(), source));
    }

    /// Builder form of [`MigrationGauges::add_source`]
    pub fn with_source(self, alias: impl Into<String>, source: Arc<dyn MigrationSource>) -> Self {
        self.add_source(alias, source);
        self
    }

    /// Registered connection aliases, in registration order
    pub fn aliases(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|(alias, _)| alias).collect()
    }

    fn snapshot(&self) -> Sources {
        self.sources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Set both gauges for every connection
    ///
    /// Returns the number of connections exported. Failures are logged and
    /// leave that connection's gauges untouched.
    pub fn export(&self) -> usize {
        let sources = self.snapshot();
        let mut exported = 0;
        for (alias, source) in &sources {
            let counts = source
                .applied_count()
                .and_then(|applied| Ok((applied, source.unapplied_count()?)));
            match counts {
                Ok((applied, unapplied)) => {
                    self.applied
                        .with_label_values(&[alias.as_str()])
                        .set(applied as i64);
                    self.unapplied
                        .with_label_values(&[alias.as_str()])
                        .set(unapplied as i64);
                    exported += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        connection = %alias,
                        error = %e,
                        "Failed to read migration state, keeping previous gauges"
                    );
                }
            }
        }
        tracing::debug!(
            exported,
            total = sources.len(),
            "Exported migration gauges"
        );
        exported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::sample_value;

    struct Unreachable;

    impl MigrationSource for Unreachable {
        fn applied_count(&self) -> Result<usize, MigrationError> {
            Err(MigrationError::Unavailable {
                alias: "replica".into(),
                reason: "connection refused".into(),
            })
        }

        fn unapplied_count(&self) -> Result<usize, MigrationError> {
            self.applied_count()
        }
    }

    #[test]
    fn test_state_counts() {
        let state = MigrationState::new("default", ["0001", "0002", "0003"], ["0001"]);
        assert_eq!(state.applied_count().unwrap(), 1);
        assert_eq!(state.unapplied_count().unwrap(), 2);
    }

    #[test]
    fn test_state_apply() {
        let mut state = MigrationState::new("default", ["0001", "0002"], Vec::<String>::new());
        state.apply("0002");
        assert_eq!(state.applied_count().unwrap(), 1);
        assert_eq!(state.unapplied_count().unwrap(), 1);
        assert_eq!(state.alias(), "default");
    }

    #[test]
    fn test_unknown_applied_migration_is_inconsistent() {
        let state = MigrationState::new("default", ["0001"], ["0001", "9999"]);
        assert!(matches!(
            state.applied_count(),
            Err(MigrationError::Inconsistent { .. })
        ));
    }

    #[test]
    fn test_export_is_idempotent() {
        let registry = MetricsRegistry::new("").unwrap();
        let gauges = MigrationGauges::new(&registry).unwrap().with_source(
            "default",
            Arc::new(MigrationState::new("default", ["a", "b"], ["a"])),
        );

        assert_eq!(gauges.export(), 1);
        assert_eq!(gauges.export(), 1);

        let labels = [("connection", "default")];
        assert_eq!(sample_value(&registry, "migrations_applied_total", &labels), Some(1.0));
        assert_eq!(sample_value(&registry, "migrations_unapplied_total", &labels), Some(1.0));
    }

    #[test]
    fn test_failing_source_keeps_previous_values() {
        let registry = MetricsRegistry::new("").unwrap();
        let gauges = MigrationGauges::new(&registry)
            .unwrap()
            .with_source(
                "default",
                Arc::new(MigrationState::new("default", ["a"], ["a"])),
            )
            .with_source("replica", Arc::new(Unreachable));

        assert_eq!(gauges.export(), 1);
        assert_eq!(
            sample_value(&registry, "migrations_applied_total", &[("connection", "replica")]),
            None
        );
        assert_eq!(gauges.aliases(), vec!["default", "replica"]);
    }
}
