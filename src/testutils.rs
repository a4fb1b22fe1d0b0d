//! Helpers for asserting on metric values in tests
//!
//! Samples are addressed the way they appear in the exposition format:
//! histograms expand to `<name>_bucket{le=...}`, `<name>_sum` and
//! `<name>_count`. A [`RegistrySnapshot`] freezes every sample so a test can
//! assert on the change caused by the code under test instead of on absolute
//! values shared with other tests.
//!
//! ```
//! use promhook::metrics::MetricsRegistry;
//! use promhook::testutils::RegistrySnapshot;
//!
//! let registry = MetricsRegistry::new("").unwrap();
//! let jobs = registry.counter("jobs_total", "Jobs").unwrap();
//! let snapshot = RegistrySnapshot::take(&registry);
//! jobs.inc_by(3);
//! assert_eq!(snapshot.diff(&registry, "jobs_total", &[]), 3.0);
//! ```

use crate::metrics::MetricsRegistry;
use prometheus::proto::MetricFamily;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Sorted label set of one sample
pub type LabelSet = Vec<(String, String)>;

/// One sample: name, labels and value
pub type Sample = (String, LabelSet, f64);

/// Flatten metric families into exposition-style samples
pub fn samples(families: &[MetricFamily]) -> Vec<Sample> {
    let mut out = Vec::new();
    for mf in families {
        let name = mf.name();
        for m in mf.get_metric() {
            let labels: LabelSet = {
                let mut labels: LabelSet = m
                    .label
                    .iter()
                    .map(|l| (l.name().to_string(), l.value().to_string()))
                    .collect();
                labels.sort();
                labels
            };

            if m.histogram.is_some() {
                let histogram = &m.histogram;
                for bucket in &histogram.bucket {
                    let mut with_le = labels.clone();
                    with_le.push(("le".to_string(), format_bound(bucket.upper_bound.unwrap_or(0.0))));
                    with_le.sort();
                    out.push((
                        format!("{}_bucket", name),
                        with_le,
                        bucket.cumulative_count.unwrap_or(0) as f64,
                    ));
                }
                let count = histogram.sample_count.unwrap_or(0) as f64;
                let mut inf = labels.clone();
                inf.push(("le".to_string(), "+Inf".to_string()));
                inf.sort();
                out.push((format!("{}_bucket", name), inf, count));
                out.push((
                    format!("{}_sum", name),
                    labels.clone(),
                    histogram.sample_sum.unwrap_or(0.0),
                ));
                out.push((format!("{}_count", name), labels, count));
            } else if m.counter.is_some() {
                out.push((name.to_string(), labels, m.counter.value.unwrap_or(0.0)));
            } else if m.gauge.is_some() {
                out.push((name.to_string(), labels, m.gauge.value.unwrap_or(0.0)));
            }
        }
    }
    out
}

/// Format a bucket bound the way the text encoder does
fn format_bound(bound: f64) -> String {
    if bound.is_infinite() {
        "+Inf".to_string()
    } else {
        format!("{}", bound)
    }
}

fn label_set(labels: &[(&str, &str)]) -> LabelSet {
    let mut set: LabelSet = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    set.sort();
    set
}

/// Current value of `name{labels}`, `None` when the sample does not exist
///
/// Labels must match exactly, including constant labels.
pub fn sample_value(registry: &MetricsRegistry, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    let wanted = label_set(labels);
    samples(&registry.families())
        .into_iter()
        .find(|(n, l, _)| n == name && *l == wanted)
        .map(|(_, _, v)| v)
}

/// Every `(labels, value)` pair recorded for `name`
pub fn metric_vector(registry: &MetricsRegistry, name: &str) -> Vec<(LabelSet, f64)> {
    samples(&registry.families())
        .into_iter()
        .filter(|(n, _, _)| n == name)
        .map(|(_, l, v)| (l, v))
        .collect()
}

/// `{k="v",...}` rendering of a label set
pub fn format_labels(labels: &[(String, String)]) -> String {
    let inner: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    format!("{{{}}}", inner.join(","))
}

/// One line per sample of a vector, for assertion messages
pub fn format_vector(vector: &[(LabelSet, f64)]) -> String {
    let mut out = String::new();
    for (labels, value) in vector {
        let _ = writeln!(out, "{} = {}", format_labels(labels), value);
    }
    out
}

/// Assert that `name{labels}` currently equals `expected`
///
/// `None` asserts the sample does not exist.
///
/// # Panics
///
/// Panics with every recorded value of `name` when the assertion fails.
pub fn assert_metric_equals(
    registry: &MetricsRegistry,
    expected: Option<f64>,
    name: &str,
    labels: &[(&str, &str)],
) {
    let actual = sample_value(registry, name, labels);
    if actual != expected {
        panic!(
            "{}{} = {:?}, expected {:?}.\nThe values for {} are:\n{}",
            name,
            format_labels(&label_set(labels)),
            actual,
            expected,
            name,
            format_vector(&metric_vector(registry, name))
        );
    }
}

/// Frozen copy of every sample of a registry
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    samples: BTreeMap<(String, LabelSet), f64>,
}

impl RegistrySnapshot {
    /// Freeze the current samples of `registry`
    pub fn take(registry: &MetricsRegistry) -> Self {
        Self::from_families(&registry.families())
    }

    /// Freeze already gathered families
    pub fn from_families(families: &[MetricFamily]) -> Self {
        Self {
            samples: samples(families)
                .into_iter()
                .map(|(n, l, v)| ((n, l), v))
                .collect(),
        }
    }

    /// Frozen value of `name{labels}`
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.samples
            .get(&(name.to_string(), label_set(labels)))
            .copied()
    }

    /// Change of `name{labels}` since the snapshot, missing samples count as 0
    pub fn diff(&self, registry: &MetricsRegistry, name: &str, labels: &[(&str, &str)]) -> f64 {
        sample_value(registry, name, labels).unwrap_or(0.0) - self.value(name, labels).unwrap_or(0.0)
    }

    /// Every sample whose value differs from the snapshot
    pub fn changed(&self, registry: &MetricsRegistry) -> Vec<Sample> {
        samples(&registry.families())
            .into_iter()
            .filter_map(|(name, labels, value)| {
                let before = self
                    .samples
                    .get(&(name.clone(), labels.clone()))
                    .copied()
                    .unwrap_or(0.0);
                let delta = value - before;
                (delta != 0.0).then_some((name, labels, delta))
            })
            .collect()
    }

    /// Assert the change of `name{labels}` since the snapshot
    ///
    /// # Panics
    ///
    /// Panics with the frozen and current values of `name` on mismatch.
    pub fn assert_diff(
        &self,
        registry: &MetricsRegistry,
        expected: f64,
        name: &str,
        labels: &[(&str, &str)],
    ) {
        let diff = self.diff(registry, name, labels);
        if diff != expected {
            panic!(
                "{}{} changed by {}, expected {}.\nThe values for {} are:\n{}",
                name,
                format_labels(&label_set(labels)),
                diff,
                expected,
                name,
                format_vector(&metric_vector(registry, name))
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_gauges() -> MetricsRegistry {
        let registry = MetricsRegistry::new("").unwrap();
        registry.gauge("some_gauge", "Some gauge.").unwrap().set(42.0);
        let labelled = registry
            .gauge_vec(
                "some_labelled_gauge",
                "Some labelled gauge.",
                &["labelred", "labelblue"],
            )
            .unwrap();
        labelled.with_label_values(&["pink", "indigo"]).set(1);
        labelled.with_label_values(&["pink", "royal"]).set(2);
        labelled.with_label_values(&["carmin", "indigo"]).set(3);
        labelled.with_label_values(&["carmin", "royal"]).set(4);
        registry
    }

    #[test]
    fn test_sample_value() {
        let registry = registry_with_gauges();
        assert_eq!(sample_value(&registry, "some_gauge", &[]), Some(42.0));
        assert_eq!(
            sample_value(
                &registry,
                "some_labelled_gauge",
                &[("labelred", "pink"), ("labelblue", "indigo")]
            ),
            Some(1.0)
        );
        assert_eq!(sample_value(&registry, "some_nonexistent_gauge", &[]), None);
    }

    #[test]
    fn test_metric_vector() {
        let registry = registry_with_gauges();
        assert!(metric_vector(&registry, "some_nonexistent_gauge").is_empty());
        assert_eq!(metric_vector(&registry, "some_gauge"), vec![(vec![], 42.0)]);

        let mut values: Vec<f64> = metric_vector(&registry, "some_labelled_gauge")
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_assert_metric_equals_passes() {
        let registry = registry_with_gauges();
        assert_metric_equals(&registry, Some(42.0), "some_gauge", &[]);
        assert_metric_equals(&registry, None, "some_nonexistent_gauge", &[]);
    }

    #[test]
    #[should_panic(expected = "expected Some(43.0)")]
    fn test_assert_metric_equals_fails_on_wrong_value() {
        let registry = registry_with_gauges();
        assert_metric_equals(&registry, Some(43.0), "some_gauge", &[]);
    }

    #[test]
    fn test_snapshot_diff_and_changed() {
        let registry = registry_with_gauges();
        let counter = registry.counter("events_total", "Events").unwrap();
        let snapshot = RegistrySnapshot::take(&registry);

        counter.inc_by(5);

        assert_eq!(snapshot.value("events_total", &[]), Some(0.0));
        assert_eq!(snapshot.diff(&registry, "events_total", &[]), 5.0);
        snapshot.assert_diff(&registry, 0.0, "some_gauge", &[]);
        let changed = snapshot.changed(&registry);
        assert_eq!(changed, vec![("events_total".to_string(), vec![], 5.0)]);
    }

    #[test]
    fn test_histogram_samples_are_expanded() {
        let registry = MetricsRegistry::new("").unwrap();
        let histogram = registry
            .histogram("size_bytes", "Sizes", Some(vec![1.0, 128.0]))
            .unwrap();
        histogram.observe(0.5);
        histogram.observe(100.0);

        assert_eq!(sample_value(&registry, "size_bytes_bucket", &[("le", "1")]), Some(1.0));
        assert_eq!(sample_value(&registry, "size_bytes_bucket", &[("le", "128")]), Some(2.0));
        assert_eq!(sample_value(&registry, "size_bytes_bucket", &[("le", "+Inf")]), Some(2.0));
        assert_eq!(sample_value(&registry, "size_bytes_count", &[]), Some(2.0));
        assert_eq!(sample_value(&registry, "size_bytes_sum", &[]), Some(100.5));
    }

    #[test]
    fn test_format_labels() {
        let labels = vec![
            ("method".to_string(), "GET".to_string()),
            ("port".to_string(), "80".to_string()),
        ];
        assert_eq!(format_labels(&labels), "{method=\"GET\",port=\"80\"}");
    }
}
