//! Tests for the metrics recording failure counter
//!
//! Label mismatches inside recording calls must never reach the caller; they
//! are counted in `metrics_recording_failures_total{operation}` instead.

use promhook::metrics::MetricsRegistry;
use promhook::testutils::{RegistrySnapshot, assert_metric_equals};

#[test]
fn test_recording_failure_metric_has_operation_label() {
    let registry = MetricsRegistry::new("promhook").expect("should create registry");

    registry.recording_failure("cache_get");
    registry.recording_failure("cache_get");
    registry.recording_failure("db_execute");
    registry.recording_failure("model_insert");

    let families = registry.families();
    let failures = families
        .iter()
        .find(|mf| mf.name() == "promhook_metrics_recording_failures_total")
        .expect("should find metrics_recording_failures_total metric");

    assert_eq!(
        failures.get_field_type(),
        prometheus::proto::MetricType::COUNTER,
        "metrics_recording_failures should be a COUNTER"
    );
    assert_eq!(failures.get_metric().len(), 3, "one series per operation");

    assert_metric_equals(
        &registry,
        Some(2.0),
        "promhook_metrics_recording_failures_total",
        &[("operation", "cache_get")],
    );
    assert_eq!(registry.recording_failures_count(), 4);
}

#[test]
fn test_label_mismatch_is_counted_not_raised() {
    let registry = MetricsRegistry::new("").expect("should create registry");
    let by_view = registry
        .counter_vec("views_total", "Views", &["view", "method"])
        .expect("should register");
    let snapshot = RegistrySnapshot::take(&registry);

    // One label value for a two-label family
    let child = registry.labeled("views", &by_view, &["/"]);

    assert!(child.is_none());
    snapshot.assert_diff(
        &registry,
        1.0,
        "metrics_recording_failures_total",
        &[("operation", "views")],
    );
    assert!(
        snapshot
            .changed(&registry)
            .iter()
            .all(|(name, _, _)| name != "views_total"),
        "the mismatched family must stay untouched"
    );
}

#[test]
fn test_matching_labels_resolve_child() {
    let registry = MetricsRegistry::new("").expect("should create registry");
    let by_view = registry
        .counter_vec("views_total", "Views", &["view", "method"])
        .expect("should register");

    registry
        .labeled("views", &by_view, &["/", "GET"])
        .expect("labels match")
        .inc();

    assert_metric_equals(&registry, Some(1.0), "views_total", &[("view", "/"), ("method", "GET")]);
    assert_eq!(registry.recording_failures_count(), 0);
}
