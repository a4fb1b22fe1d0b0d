//! Prometheus registry and HTTP request metrics
//!
//! [`MetricsRegistry`] is the explicitly constructed registry every metrics
//! bundle in this crate registers into. It applies the configured namespace
//! to metric names, optionally stamps constant labels (the worker identity in
//! multi-process mode) and counts its own recording failures.
//!
//! [`HttpMetrics`] holds the request/response families recorded by the
//! before/after middleware pair.

use crate::tracker::{Observation, RequestTimingTracker, TimingSlot};
use prometheus::core::{Collector, MetricVec, MetricVecBuilder};
use prometheus::proto::MetricFamily;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Default buckets for request latency histograms, in seconds
pub const DEFAULT_LATENCY_BUCKETS: [f64; 16] = [
    0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0, 25.0, 50.0, 75.0,
];

/// `count` powers of `base` starting at `base^0`, preceded by `0`
///
/// Used for body-size histograms: `[0, 1, 2, 4, ..., 2^29]` for `(2, 30)`.
pub fn powers_of(base: u32, count: u32) -> Vec<f64> {
    std::iter::once(0.0)
        .chain((0..count).map(|exp| f64::from(base).powi(exp as i32)))
        .collect()
}

/// Registry shared by every metrics bundle of a process
///
/// Cheap to clone: clones share the same underlying registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    namespace: String,
    recording_failures: IntCounterVec,
}

impl MetricsRegistry {
    /// Create a registry whose metric names are prefixed with `namespace`
    ///
    /// An empty namespace leaves names untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal failure counter cannot be registered.
    pub fn new(namespace: &str) -> Result<Self, prometheus::Error> {
        Self::build(Registry::new(), namespace)
    }

    /// Create a registry that stamps `const_labels` on every sample
    ///
    /// Multi-process mode uses this to attach the `worker` label.
    pub fn with_const_labels(
        namespace: &str,
        const_labels: HashMap<String, String>,
    ) -> Result<Self, prometheus::Error> {
        Self::build(Registry::new_custom(None, Some(const_labels))?, namespace)
    }

    fn build(registry: Registry, namespace: &str) -> Result<Self, prometheus::Error> {
        // Counter: metrics plumbing failures by operation
        //
        // Labels come from a fixed set of call sites in this crate, so
        // cardinality is bounded by the number of recording operations.
        let recording_failures = IntCounterVec::new(
            Opts::new(
                "metrics_recording_failures_total",
                "Total number of metric recording failures (label mismatches, encoder errors) by operation. \
                Recording failures never affect the instrumented operation.",
            )
            .namespace(namespace),
            &["operation"],
        )?;
        registry.register(Box::new(recording_failures.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            namespace: namespace.to_string(),
            recording_failures,
        })
    }

    /// The underlying Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Configured namespace ("" when unset)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fully qualified name of a metric registered through this registry
    pub fn qualified_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.namespace, name)
        }
    }

    /// Register an already-built collector and hand it back
    pub fn register<C>(&self, collector: C) -> Result<C, prometheus::Error>
    where
        C: Collector + Clone + 'static,
    {
        self.registry.register(Box::new(collector.clone()))?;
        Ok(collector)
    }

    /// Build and register an unlabeled counter
    pub fn counter(&self, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
        self.register(IntCounter::with_opts(
            Opts::new(name, help).namespace(self.namespace.as_str()),
        )?)
    }

    /// Build and register a labeled counter family
    pub fn counter_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<IntCounterVec, prometheus::Error> {
        self.register(IntCounterVec::new(
            Opts::new(name, help).namespace(self.namespace.as_str()),
            labels,
        )?)
    }

    /// Build and register an unlabeled histogram
    ///
    /// `None` buckets use the Prometheus client defaults.
    pub fn histogram(
        &self,
        name: &str,
        help: &str,
        buckets: Option<Vec<f64>>,
    ) -> Result<Histogram, prometheus::Error> {
        let mut opts = HistogramOpts::new(name, help).namespace(self.namespace.as_str());
        if let Some(buckets) = buckets {
            opts = opts.buckets(buckets);
        }
        self.register(Histogram::with_opts(opts)?)
    }

    /// Build and register a labeled histogram family
    pub fn histogram_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
        buckets: Option<Vec<f64>>,
    ) -> Result<HistogramVec, prometheus::Error> {
        let mut opts = HistogramOpts::new(name, help).namespace(self.namespace.as_str());
        if let Some(buckets) = buckets {
            opts = opts.buckets(buckets);
        }
        self.register(HistogramVec::new(opts, labels)?)
    }

    /// Build and register a labeled integer gauge family
    pub fn gauge_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<IntGaugeVec, prometheus::Error> {
        self.register(IntGaugeVec::new(
            Opts::new(name, help).namespace(self.namespace.as_str()),
            labels,
        )?)
    }

    /// Build and register an unlabeled floating point gauge
    pub fn gauge(&self, name: &str, help: &str) -> Result<Gauge, prometheus::Error> {
        self.register(Gauge::with_opts(
            Opts::new(name, help).namespace(self.namespace.as_str()),
        )?)
    }

    /// Resolve a labeled child without ever failing the caller
    ///
    /// A label-count mismatch is logged and counted under `operation`, and
    /// `None` is returned so the caller can skip the update.
    pub fn labeled<P: MetricVecBuilder>(
        &self,
        operation: &str,
        vec: &MetricVec<P>,
        values: &[&str],
    ) -> Option<P::M> {
        match vec.get_metric_with_label_values(values) {
            Ok(metric) => Some(metric),
            Err(e) => {
                tracing::warn!(
                    operation,
                    error = %e,
                    labels = ?values,
                    "Failed to resolve labeled metric, skipping update"
                );
                self.recording_failure(operation);
                None
            }
        }
    }

    /// Count a metrics plumbing failure for `operation`
    pub fn recording_failure(&self, operation: &str) {
        self.recording_failures
            .with_label_values(&[operation])
            .inc();
    }

    /// Total recording failures across all operations
    pub fn recording_failures_count(&self) -> u64 {
        let name = self.qualified_name("metrics_recording_failures_total");
        self.registry
            .gather()
            .iter()
            .find(|mf| mf.name() == name)
            .map(|mf| {
                mf.get_metric()
                    .iter()
                    .map(|m| m.counter.value.unwrap_or(0.0) as u64)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Current metric families, sorted by name
    pub fn families(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Gather all metrics and encode them in Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns an error if metric encoding fails.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        encode_text(&self.registry.gather())
    }
}

/// Encode metric families in Prometheus text format
pub fn encode_text(metric_families: &[MetricFamily]) -> Result<String, prometheus::Error> {
    let metric_count = metric_families.len();

    tracing::debug!(
        metric_family_count = metric_count,
        "Encoding metrics to Prometheus text format"
    );

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    encoder.encode(metric_families, &mut buffer).map_err(|e| {
        let metric_names: Vec<_> = metric_families.iter().map(|mf| mf.name()).collect();

        tracing::error!(
            error = %e,
            metric_family_count = metric_count,
            metric_names = ?metric_names,
            "Prometheus text encoder failed"
        );

        prometheus::Error::Msg(format!(
            "Failed to encode {} metric families: {}. Metrics: {:?}",
            metric_count, e, metric_names
        ))
    })?;

    String::from_utf8(buffer).map_err(|e| {
        let valid_up_to = e.utf8_error().valid_up_to();

        tracing::error!(
            invalid_byte_index = valid_up_to,
            "Prometheus encoder produced invalid UTF-8"
        );

        prometheus::Error::Msg(format!(
            "Failed to convert metrics to UTF-8 at byte {}: {}",
            valid_up_to, e
        ))
    })
}

/// Names of the labeled HTTP families, without the namespace prefix
///
/// Only these families accept extra labels; the before-pair families and the
/// plain counters and histograms keep a fixed shape.
pub mod family {
    pub const REQUESTS_BY_METHOD: &str = "http_requests_total_by_method";
    pub const REQUESTS_BY_TRANSPORT: &str = "http_requests_total_by_transport";
    pub const REQUESTS_BY_VIEW_TRANSPORT_METHOD: &str =
        "http_requests_total_by_view_transport_method";
    pub const REQUESTS_LATENCY_BY_VIEW_METHOD: &str =
        "http_requests_latency_seconds_by_view_method";
    pub const RESPONSES_BY_TEMPLATENAME: &str = "http_responses_total_by_templatename";
    pub const RESPONSES_BY_STATUS: &str = "http_responses_total_by_status";
    pub const RESPONSES_BY_STATUS_VIEW_METHOD: &str = "http_responses_total_by_status_view_method";
    pub const RESPONSES_BY_CHARSET: &str = "http_responses_total_by_charset";
    pub const EXCEPTIONS_BY_TYPE: &str = "http_exceptions_total_by_type";
    pub const EXCEPTIONS_BY_VIEW: &str = "http_exceptions_total_by_view";

    pub const EXTENSIBLE: [&str; 10] = [
        REQUESTS_BY_METHOD,
        REQUESTS_BY_TRANSPORT,
        REQUESTS_BY_VIEW_TRANSPORT_METHOD,
        REQUESTS_LATENCY_BY_VIEW_METHOD,
        RESPONSES_BY_TEMPLATENAME,
        RESPONSES_BY_STATUS,
        RESPONSES_BY_STATUS_VIEW_METHOD,
        RESPONSES_BY_CHARSET,
        EXCEPTIONS_BY_TYPE,
        EXCEPTIONS_BY_VIEW,
    ];
}

/// Extra label names per family, appended after the built-in labels
pub type ExtraLabelNames = HashMap<String, Vec<String>>;

/// Values for extra labels of one recording, keyed by family
///
/// Families without an entry record only their built-in labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraLabels(HashMap<&'static str, Vec<String>>);

impl ExtraLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, family: &'static str, values: Vec<String>) {
        self.0.insert(family, values);
    }

    pub fn get(&self, family: &str) -> &[String] {
        self.0.get(family).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn label_names<'a>(base: &[&'a str], extra: &'a ExtraLabelNames, family: &str) -> Vec<&'a str> {
    let mut names = base.to_vec();
    if let Some(more) = extra.get(family) {
        names.extend(more.iter().map(String::as_str));
    }
    names
}

/// Request/response metric families recorded by the middleware pair
///
/// Names mirror the before/after split: the `*_before_middlewares_*` and
/// `*_including_middlewares_*` families belong to the outermost layer, every
/// other family to the innermost one.
#[derive(Clone)]
pub struct HttpMetrics {
    registry: MetricsRegistry,
    extended: Arc<HashSet<&'static str>>,
    // before pair
    requests_total: IntCounter,
    responses_total: IntCounter,
    requests_latency_before: Histogram,
    requests_unknown_latency_before: IntCounter,
    // after pair, request side
    requests_ajax: IntCounter,
    requests_by_method: IntCounterVec,
    requests_by_transport: IntCounterVec,
    requests_by_view_transport_method: IntCounterVec,
    requests_body_bytes: Histogram,
    // after pair, response side
    requests_latency_by_view_method: HistogramVec,
    requests_unknown_latency: IntCounter,
    responses_by_templatename: IntCounterVec,
    responses_by_status: IntCounterVec,
    responses_by_status_view_method: IntCounterVec,
    responses_body_bytes: Histogram,
    responses_by_charset: IntCounterVec,
    responses_streaming: IntCounter,
    // exceptions
    exceptions_by_type: IntCounterVec,
    exceptions_by_view: IntCounterVec,
}

impl HttpMetrics {
    /// Register every HTTP family into `registry`
    ///
    /// `latency_buckets` applies to the per-view latency histogram; the
    /// including-middlewares histogram keeps the client default buckets.
    ///
    /// # Errors
    ///
    /// Returns an error if a family is already registered or the buckets are
    /// rejected by the client.
    pub fn new(
        registry: &MetricsRegistry,
        latency_buckets: Vec<f64>,
    ) -> Result<Self, prometheus::Error> {
        Self::with_extra_labels(registry, latency_buckets, &ExtraLabelNames::new())
    }

    /// Register every HTTP family, appending `extra` label names
    ///
    /// Keys of `extra` are unprefixed family names from [`family::EXTENSIBLE`].
    ///
    /// # Errors
    ///
    /// Returns an error for a key naming any other family, an extra label
    /// that collides with a built-in one, or a failed registration.
    pub fn with_extra_labels(
        registry: &MetricsRegistry,
        latency_buckets: Vec<f64>,
        extra: &ExtraLabelNames,
    ) -> Result<Self, prometheus::Error> {
        let mut extended = HashSet::new();
        for (name, labels) in extra {
            let known = family::EXTENSIBLE
                .iter()
                .find(|f| **f == name.as_str())
                .ok_or_else(|| {
                    prometheus::Error::Msg(format!(
                        "Family '{}' does not accept extra labels",
                        name
                    ))
                })?;
            if !labels.is_empty() {
                extended.insert(*known);
            }
        }

        let r = registry;
        Ok(Self {
            requests_total: r.counter(
                "http_requests_before_middlewares_total",
                "Total count of requests before middlewares run.",
            )?,
            responses_total: r.counter(
                "http_responses_before_middlewares_total",
                "Total count of responses before middlewares run.",
            )?,
            requests_latency_before: r.histogram(
                "http_requests_latency_including_middlewares_seconds",
                "Histogram of requests processing time (including middleware processing time).",
                None,
            )?,
            requests_unknown_latency_before: r.counter(
                "http_requests_unknown_latency_including_middlewares_total",
                "Count of requests for which the latency was unknown \
                (when computing http_requests_latency_including_middlewares_seconds).",
            )?,
            requests_ajax: r.counter("http_ajax_requests_total", "Count of AJAX requests.")?,
            requests_by_method: r.counter_vec(
                family::REQUESTS_BY_METHOD,
                "Count of requests by method.",
                &label_names(&["method"], extra, family::REQUESTS_BY_METHOD),
            )?,
            requests_by_transport: r.counter_vec(
                family::REQUESTS_BY_TRANSPORT,
                "Count of requests by transport.",
                &label_names(&["transport"], extra, family::REQUESTS_BY_TRANSPORT),
            )?,
            requests_by_view_transport_method: r.counter_vec(
                family::REQUESTS_BY_VIEW_TRANSPORT_METHOD,
                "Count of requests by view, transport, method.",
                &label_names(
                    &["view", "transport", "method"],
                    extra,
                    family::REQUESTS_BY_VIEW_TRANSPORT_METHOD,
                ),
            )?,
            requests_body_bytes: r.histogram(
                "http_requests_body_total_bytes",
                "Histogram of requests by body size.",
                Some(powers_of(2, 30)),
            )?,
            requests_latency_by_view_method: r.histogram_vec(
                family::REQUESTS_LATENCY_BY_VIEW_METHOD,
                "Histogram of request processing time labelled by view.",
                &label_names(&["view", "method"], extra, family::REQUESTS_LATENCY_BY_VIEW_METHOD),
                Some(latency_buckets),
            )?,
            requests_unknown_latency: r.counter(
                "http_requests_unknown_latency_total",
                "Count of requests for which the latency was unknown.",
            )?,
            responses_by_templatename: r.counter_vec(
                family::RESPONSES_BY_TEMPLATENAME,
                "Count of responses by template name.",
                &label_names(&["templatename"], extra, family::RESPONSES_BY_TEMPLATENAME),
            )?,
            responses_by_status: r.counter_vec(
                family::RESPONSES_BY_STATUS,
                "Count of responses by status.",
                &label_names(&["status"], extra, family::RESPONSES_BY_STATUS),
            )?,
            responses_by_status_view_method: r.counter_vec(
                family::RESPONSES_BY_STATUS_VIEW_METHOD,
                "Count of responses by status, view, method.",
                &label_names(
                    &["status", "view", "method"],
                    extra,
                    family::RESPONSES_BY_STATUS_VIEW_METHOD,
                ),
            )?,
            responses_body_bytes: r.histogram(
                "http_responses_body_total_bytes",
                "Histogram of responses by body size.",
                Some(powers_of(2, 30)),
            )?,
            responses_by_charset: r.counter_vec(
                family::RESPONSES_BY_CHARSET,
                "Count of responses by charset.",
                &label_names(&["charset"], extra, family::RESPONSES_BY_CHARSET),
            )?,
            responses_streaming: r.counter(
                "http_responses_streaming_total",
                "Count of streaming responses.",
            )?,
            exceptions_by_type: r.counter_vec(
                family::EXCEPTIONS_BY_TYPE,
                "Count of exceptions by object type.",
                &label_names(&["type"], extra, family::EXCEPTIONS_BY_TYPE),
            )?,
            exceptions_by_view: r.counter_vec(
                family::EXCEPTIONS_BY_VIEW,
                "Count of exceptions by view.",
                &label_names(&["view"], extra, family::EXCEPTIONS_BY_VIEW),
            )?,
            registry: registry.clone(),
            extended: Arc::new(extended),
        })
    }

    /// The registry these families live in
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Whether `family` was registered with extra labels
    pub fn is_extended(&self, family: &str) -> bool {
        self.extended.contains(family)
    }

    fn child<P: MetricVecBuilder>(
        &self,
        operation: &str,
        family: &'static str,
        vec: &MetricVec<P>,
        base: &[&str],
        extra: &ExtraLabels,
    ) -> Option<P::M> {
        let mut values = base.to_vec();
        values.extend(extra.get(family).iter().map(String::as_str));
        self.registry.labeled(operation, vec, &values)
    }

    // Before pair

    /// Outermost request hook: count and mark the before slot
    pub fn before_request(&self, slot: &mut TimingSlot) {
        self.requests_total.inc();
        RequestTimingTracker::mark_start(slot);
    }

    /// Outermost response hook: count and observe the before slot
    pub fn before_response(&self, slot: &TimingSlot) -> Observation {
        self.responses_total.inc();
        RequestTimingTracker::observe_elapsed(
            slot,
            &self.requests_latency_before,
            &self.requests_unknown_latency_before,
        )
    }

    // After pair

    /// Innermost request hook counters
    pub fn after_request(
        &self,
        method: &str,
        transport: &str,
        ajax: bool,
        body_bytes: u64,
        extra: &ExtraLabels,
    ) {
        if let Some(c) = self.child(
            "requests_by_method",
            family::REQUESTS_BY_METHOD,
            &self.requests_by_method,
            &[method],
            extra,
        ) {
            c.inc();
        }
        if let Some(c) = self.child(
            "requests_by_transport",
            family::REQUESTS_BY_TRANSPORT,
            &self.requests_by_transport,
            &[transport],
            extra,
        ) {
            c.inc();
        }
        if ajax {
            self.requests_ajax.inc();
        }
        self.requests_body_bytes.observe(body_bytes as f64);
    }

    /// Route resolved: count by view, transport and method
    pub fn view(&self, view: &str, transport: &str, method: &str, extra: &ExtraLabels) {
        if let Some(c) = self.child(
            "requests_by_view_transport_method",
            family::REQUESTS_BY_VIEW_TRANSPORT_METHOD,
            &self.requests_by_view_transport_method,
            &[view, transport, method],
            extra,
        ) {
            c.inc();
        }
    }

    /// Response status counters
    pub fn response_status(&self, status: &str, view: &str, method: &str, extra: &ExtraLabels) {
        if let Some(c) = self.child(
            "responses_by_status",
            family::RESPONSES_BY_STATUS,
            &self.responses_by_status,
            &[status],
            extra,
        ) {
            c.inc();
        }
        if let Some(c) = self.child(
            "responses_by_status_view_method",
            family::RESPONSES_BY_STATUS_VIEW_METHOD,
            &self.responses_by_status_view_method,
            &[status, view, method],
            extra,
        ) {
            c.inc();
        }
    }

    /// Response charset counter
    pub fn response_charset(&self, charset: &str, extra: &ExtraLabels) {
        if let Some(c) = self.child(
            "responses_by_charset",
            family::RESPONSES_BY_CHARSET,
            &self.responses_by_charset,
            &[charset],
            extra,
        ) {
            c.inc();
        }
    }

    /// Response rendered from a named template
    pub fn response_template(&self, template: &str, extra: &ExtraLabels) {
        if let Some(c) = self.child(
            "responses_by_templatename",
            family::RESPONSES_BY_TEMPLATENAME,
            &self.responses_by_templatename,
            &[template],
            extra,
        ) {
            c.inc();
        }
    }

    /// Response body size, or a streaming response when the size is unknown
    pub fn response_body(&self, body_bytes: Option<u64>) {
        match body_bytes {
            Some(bytes) => self.responses_body_bytes.observe(bytes as f64),
            None => self.responses_streaming.inc(),
        }
    }

    /// Exception counters by type and, once routed, by view
    pub fn exception(&self, type_name: &str, view: Option<&str>, extra: &ExtraLabels) {
        if let Some(c) = self.child(
            "exceptions_by_type",
            family::EXCEPTIONS_BY_TYPE,
            &self.exceptions_by_type,
            &[type_name],
            extra,
        ) {
            c.inc();
        }
        if let Some(view) = view {
            if let Some(c) = self.child(
                "exceptions_by_view",
                family::EXCEPTIONS_BY_VIEW,
                &self.exceptions_by_view,
                &[view],
                extra,
            ) {
                c.inc();
            }
        }
    }

    /// Observe the after slot into the per-view latency histogram
    pub fn after_latency(
        &self,
        slot: &TimingSlot,
        view: &str,
        method: &str,
        extra: &ExtraLabels,
    ) -> Observation {
        match self.child(
            "requests_latency_by_view_method",
            family::REQUESTS_LATENCY_BY_VIEW_METHOD,
            &self.requests_latency_by_view_method,
            &[view, method],
            extra,
        ) {
            Some(histogram) => RequestTimingTracker::observe_elapsed(
                slot,
                &histogram,
                &self.requests_unknown_latency,
            ),
            None => Observation::Unknown,
        }
    }
}
