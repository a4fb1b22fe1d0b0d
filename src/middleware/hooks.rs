//! Framework-agnostic request hooks
//!
//! Two hook objects bracket the request pipeline. [`BeforeMiddleware`] runs
//! first and last (outermost), [`AfterMiddleware`] runs closest to the handler
//! (innermost). Each owns its own timing slot in the [`RequestContext`] and
//! its own latency family, so latency "including middlewares" and latency of
//! the routed handler are measured independently.
//!
//! Hooks never fail: recording problems are logged and counted by the
//! registry, and the request continues untouched.

use super::context::{RequestContext, ResponseInfo};
use super::custom_labels::{self, LabelExtender};
use crate::labels;
use crate::metrics::{ExtraLabels, HttpMetrics};
use crate::tracker::{Observation, RequestTimingTracker};
use std::sync::Arc;

/// Exception label used for handler panics
pub const PANIC_EXCEPTION: &str = "panic";

/// Outermost hook pair
#[derive(Clone)]
pub struct BeforeMiddleware {
    metrics: HttpMetrics,
    trust_forwarded_proto: bool,
}

impl BeforeMiddleware {
    pub fn new(metrics: HttpMetrics, trust_forwarded_proto: bool) -> Self {
        Self {
            metrics,
            trust_forwarded_proto,
        }
    }

    pub fn trust_forwarded_proto(&self) -> bool {
        self.trust_forwarded_proto
    }

    /// Count the request and mark the outer timing slot
    pub fn process_request(&self, ctx: &mut RequestContext) {
        self.metrics.before_request(&mut ctx.before);
    }

    /// Count the response and observe latency including every middleware
    pub fn process_response(&self, ctx: &RequestContext) -> Observation {
        let observation = self.metrics.before_response(&ctx.before);
        if observation == Observation::Unknown {
            tracing::debug!(
                method = ctx.method_label(),
                "Response without a before-middleware timing mark"
            );
        }
        observation
    }
}

/// Innermost hook pair
#[derive(Clone)]
pub struct AfterMiddleware {
    metrics: HttpMetrics,
    trust_forwarded_proto: bool,
    extender: Option<Arc<dyn LabelExtender>>,
}

impl AfterMiddleware {
    pub fn new(metrics: HttpMetrics, trust_forwarded_proto: bool) -> Self {
        Self {
            metrics,
            trust_forwarded_proto,
            extender: None,
        }
    }

    /// Supply extra label values from `extender`
    ///
    /// `metrics` must have been registered with the extender's label names.
    pub fn with_extender(mut self, extender: Arc<dyn LabelExtender>) -> Self {
        self.extender = Some(extender);
        self
    }

    fn extra(
        &self,
        families: &[&'static str],
        ctx: &RequestContext,
        response: Option<&ResponseInfo>,
    ) -> ExtraLabels {
        match &self.extender {
            Some(extender) => {
                custom_labels::collect(extender.as_ref(), &self.metrics, families, ctx, response)
            }
            None => ExtraLabels::new(),
        }
    }

    pub fn trust_forwarded_proto(&self) -> bool {
        self.trust_forwarded_proto
    }

    /// Count by method/transport/body size and mark the inner timing slot
    pub fn process_request(&self, ctx: &mut RequestContext) {
        let extra = self.extra(&custom_labels::REQUEST_FAMILIES, ctx, None);
        self.metrics.after_request(
            ctx.method_label(),
            ctx.transport().as_str(),
            ctx.is_ajax(),
            ctx.content_length(),
            &extra,
        );
        RequestTimingTracker::mark_start(&mut ctx.after);
    }

    /// Count by view once the router has resolved a handler
    ///
    /// A context without a resolved view is left uncounted.
    pub fn process_view(&self, ctx: &RequestContext) {
        if let Some(view) = ctx.view() {
            let extra = self.extra(&custom_labels::VIEW_FAMILIES, ctx, None);
            self.metrics
                .view(view, ctx.transport().as_str(), ctx.method_label(), &extra);
        }
    }

    /// Count the response and observe handler latency
    pub fn process_response(&self, ctx: &RequestContext, response: &ResponseInfo) -> Observation {
        let method = ctx.method_label();
        let view = ctx.view_label();
        let status = labels::status_label(response.status);
        let extra = self.extra(&custom_labels::RESPONSE_FAMILIES, ctx, Some(response));

        self.metrics.response_status(&status, view, method, &extra);
        if let Some(template) = response.template.as_deref() {
            self.metrics.response_template(template, &extra);
        }
        if let Some(charset) = response.charset.as_deref() {
            self.metrics.response_charset(charset, &extra);
        }
        self.metrics.response_body(response.body_bytes);

        self.metrics.after_latency(&ctx.after, view, method, &extra)
    }

    /// Count a handler failure and observe latency up to the failure
    pub fn process_exception(&self, ctx: &RequestContext, type_name: &str) -> Observation {
        tracing::debug!(
            exception = type_name,
            view = ctx.view_label(),
            "Handler raised an exception"
        );
        let extra = self.extra(&custom_labels::EXCEPTION_FAMILIES, ctx, None);
        self.metrics.exception(type_name, ctx.view(), &extra);
        self.metrics
            .after_latency(&ctx.after, ctx.view_label(), ctx.method_label(), &extra)
    }
}
