//! Application-defined labels on the HTTP families
//!
//! A [`LabelExtender`] names extra labels for some of the labeled families in
//! [`family::EXTENSIBLE`] and supplies their values per request. The names
//! are fixed when [`HttpMetrics::with_extra_labels`] registers the families;
//! the values are asked for on every recording of those families.
//!
//! [`HttpMetrics::with_extra_labels`]: crate::metrics::HttpMetrics::with_extra_labels

use super::context::{RequestContext, ResponseInfo};
use crate::metrics::{ExtraLabelNames, ExtraLabels, HttpMetrics, family};

/// Source of extra label names and values
pub trait LabelExtender: Send + Sync {
    /// Extra label names by unprefixed family name
    fn label_names(&self) -> ExtraLabelNames;

    /// Values for `family`'s extra labels, in [`label_names`](Self::label_names) order
    ///
    /// `response` is `None` on the request side and for exceptions.
    fn label_values(
        &self,
        family: &str,
        request: &RequestContext,
        response: Option<&ResponseInfo>,
    ) -> Vec<String>;
}

/// Collect extra values for the extended families among `families`
pub(crate) fn collect(
    extender: &dyn LabelExtender,
    metrics: &HttpMetrics,
    families: &[&'static str],
    request: &RequestContext,
    response: Option<&ResponseInfo>,
) -> ExtraLabels {
    let mut extra = ExtraLabels::new();
    for &name in families {
        if metrics.is_extended(name) {
            extra.insert(name, extender.label_values(name, request, response));
        }
    }
    extra
}

/// Families recorded on the request side of the after pair
pub(crate) const REQUEST_FAMILIES: [&str; 2] =
    [family::REQUESTS_BY_METHOD, family::REQUESTS_BY_TRANSPORT];

/// Families recorded once the route is resolved
pub(crate) const VIEW_FAMILIES: [&str; 1] = [family::REQUESTS_BY_VIEW_TRANSPORT_METHOD];

/// Families recorded for a response
pub(crate) const RESPONSE_FAMILIES: [&str; 5] = [
    family::RESPONSES_BY_STATUS,
    family::RESPONSES_BY_STATUS_VIEW_METHOD,
    family::RESPONSES_BY_TEMPLATENAME,
    family::RESPONSES_BY_CHARSET,
    family::REQUESTS_LATENCY_BY_VIEW_METHOD,
];

/// Families recorded for a handler exception
pub(crate) const EXCEPTION_FAMILIES: [&str; 3] = [
    family::EXCEPTIONS_BY_TYPE,
    family::EXCEPTIONS_BY_VIEW,
    family::REQUESTS_LATENCY_BY_VIEW_METHOD,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{DEFAULT_LATENCY_BUCKETS, MetricsRegistry};
    use axum::http::{HeaderMap, Method, StatusCode};
    use std::collections::HashMap;

    struct StatusClass;

    impl LabelExtender for StatusClass {
        fn label_names(&self) -> ExtraLabelNames {
            HashMap::from([(
                family::RESPONSES_BY_STATUS.to_string(),
                vec!["class".to_string()],
            )])
        }

        fn label_values(
            &self,
            _family: &str,
            _request: &RequestContext,
            response: Option<&ResponseInfo>,
        ) -> Vec<String> {
            let class = response.map(|r| r.status.as_u16() / 100).unwrap_or(0);
            vec![format!("{}xx", class)]
        }
    }

    #[test]
    fn test_collect_only_asks_for_extended_families() {
        let registry = MetricsRegistry::new("").unwrap();
        let metrics = HttpMetrics::with_extra_labels(
            &registry,
            DEFAULT_LATENCY_BUCKETS.to_vec(),
            &StatusClass.label_names(),
        )
        .unwrap();
        let ctx = RequestContext::from_parts(&Method::GET, &"/".parse().unwrap(), &HeaderMap::new(), false);
        let response = ResponseInfo::with_status(StatusCode::NOT_FOUND);

        let extra = collect(&StatusClass, &metrics, &RESPONSE_FAMILIES, &ctx, Some(&response));

        assert_eq!(extra.get(family::RESPONSES_BY_STATUS).to_vec(), vec!["4xx".to_string()]);
        assert!(extra.get(family::RESPONSES_BY_STATUS_VIEW_METHOD).is_empty());
    }

    #[test]
    fn test_unextended_metrics_collect_nothing() {
        let registry = MetricsRegistry::new("").unwrap();
        let metrics = HttpMetrics::new(&registry, DEFAULT_LATENCY_BUCKETS.to_vec()).unwrap();
        let ctx = RequestContext::from_parts(&Method::GET, &"/".parse().unwrap(), &HeaderMap::new(), false);

        let extra = collect(&StatusClass, &metrics, &REQUEST_FAMILIES, &ctx, None);

        assert!(extra.is_empty());
    }
}
