//! Axum adapters for the request hooks
//!
//! `before_middleware` belongs on the outermost layer of the application,
//! `after_middleware` on the innermost, so application middleware sits
//! between the two. [`MetricsLayers::apply`] installs both in that order.

use super::context::{HandlerException, RequestContext, ResponseInfo};
use super::custom_labels::LabelExtender;
use super::hooks::{AfterMiddleware, BeforeMiddleware, PANIC_EXCEPTION};
use crate::metrics::HttpMetrics;
use axum::{
    Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Outermost middleware: request totals and latency including middlewares
pub async fn before_middleware(
    State(hooks): State<BeforeMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    let mut ctx = RequestContext::from_request(&request, hooks.trust_forwarded_proto());
    hooks.process_request(&mut ctx);

    let response = next.run(request).await;

    hooks.process_response(&ctx);
    response
}

/// Innermost middleware: per-method/view/status counters and handler latency
///
/// A response carrying [`HandlerException`] is counted as an exception before
/// the regular response accounting. A panicking handler is counted with the
/// `panic` type and the panic is resumed unchanged.
pub async fn after_middleware(
    State(hooks): State<AfterMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    let mut ctx = RequestContext::from_request(&request, hooks.trust_forwarded_proto());
    hooks.process_request(&mut ctx);
    hooks.process_view(&ctx);

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => {
            if let Some(exception) = response.extensions().get::<HandlerException>() {
                hooks.process_exception(&ctx, exception.type_name());
            }
            hooks.process_response(&ctx, &ResponseInfo::from_response(&response));
            response
        }
        Err(payload) => {
            hooks.process_exception(&ctx, PANIC_EXCEPTION);
            std::panic::resume_unwind(payload)
        }
    }
}

/// The before/after middleware pair sharing one set of HTTP metrics
#[derive(Clone)]
pub struct MetricsLayers {
    before: BeforeMiddleware,
    after: AfterMiddleware,
}

impl MetricsLayers {
    pub fn new(metrics: HttpMetrics, trust_forwarded_proto: bool) -> Self {
        Self {
            before: BeforeMiddleware::new(metrics.clone(), trust_forwarded_proto),
            after: AfterMiddleware::new(metrics, trust_forwarded_proto),
        }
    }

    /// Pair whose innermost hooks take extra label values from `extender`
    ///
    /// Build `metrics` with [`HttpMetrics::with_extra_labels`] from the
    /// extender's [`LabelExtender::label_names`].
    pub fn with_extender(
        metrics: HttpMetrics,
        trust_forwarded_proto: bool,
        extender: Arc<dyn LabelExtender>,
    ) -> Self {
        Self {
            before: BeforeMiddleware::new(metrics.clone(), trust_forwarded_proto),
            after: AfterMiddleware::new(metrics, trust_forwarded_proto).with_extender(extender),
        }
    }

    pub fn before(&self) -> &BeforeMiddleware {
        &self.before
    }

    pub fn after(&self) -> &AfterMiddleware {
        &self.after
    }

    /// Wrap `router` with the innermost and outermost layers
    ///
    /// Layers added to the router after this call end up outside the before
    /// middleware; add application middleware between `with_after` and
    /// `with_before` to have it measured.
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        self.with_before(self.with_after(router))
    }

    /// Install only the innermost layer
    pub fn with_after<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(middleware::from_fn_with_state(
            self.after.clone(),
            after_middleware,
        ))
    }

    /// Install only the outermost layer
    pub fn with_before<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(middleware::from_fn_with_state(
            self.before.clone(),
            before_middleware,
        ))
    }
}
