//! Per-request state threaded through the hook calls
//!
//! Label values are derived once, when the context is built from the
//! request, so every hook of the same request sees identical labels.

use crate::labels::{self, Transport};
use crate::tracker::TimingSlot;
use axum::body::HttpBody;
use axum::extract::{MatchedPath, Request};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::Response;

/// Header value marking an AJAX request
const XML_HTTP_REQUEST: &str = "XMLHttpRequest";

/// Request facts and timing slots for one in-flight request
///
/// Owned by exactly one request; hooks borrow it, nothing shares it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: &'static str,
    transport: Transport,
    view: Option<String>,
    ajax: bool,
    content_length: u64,
    pub(crate) before: TimingSlot,
    pub(crate) after: TimingSlot,
}

impl RequestContext {
    /// Build a context from request parts
    pub fn from_parts(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        trust_forwarded_proto: bool,
    ) -> Self {
        let ajax = headers
            .get("x-requested-with")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == XML_HTTP_REQUEST)
            .unwrap_or(false);

        // Missing or malformed Content-Length counts as an empty body
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);

        Self {
            method: labels::method_label(method),
            transport: Transport::detect(uri, headers, trust_forwarded_proto),
            view: None,
            ajax,
            content_length,
            before: TimingSlot::empty(),
            after: TimingSlot::empty(),
        }
    }

    /// Build a context from an Axum request, picking up its matched route
    pub fn from_request(request: &Request, trust_forwarded_proto: bool) -> Self {
        let mut context = Self::from_parts(
            request.method(),
            request.uri(),
            request.headers(),
            trust_forwarded_proto,
        );
        if let Some(matched) = request.extensions().get::<MatchedPath>() {
            context.resolve_view(matched.as_str());
        }
        context
    }

    /// Record the handler the router resolved for this request
    pub fn resolve_view(&mut self, view: impl Into<String>) {
        self.view = Some(view.into());
    }

    /// Resolved route, if routing has happened
    pub fn view(&self) -> Option<&str> {
        self.view.as_deref()
    }

    /// Route label, `<unnamed view>` before resolution
    pub fn view_label(&self) -> &str {
        self.view.as_deref().unwrap_or(labels::UNNAMED_VIEW)
    }

    /// Allow-listed method label
    pub fn method_label(&self) -> &'static str {
        self.method
    }

    /// Transport of the request
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Whether the request was sent as AJAX
    pub fn is_ajax(&self) -> bool {
        self.ajax
    }

    /// Declared request body size in bytes
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Timing slot of the outermost hook pair
    pub fn before_slot(&self) -> &TimingSlot {
        &self.before
    }

    /// Timing slot of the innermost hook pair
    pub fn after_slot(&self) -> &TimingSlot {
        &self.after
    }
}

/// Template a response was rendered from
///
/// Handlers that render templates insert this into the response extensions
/// to have the response counted by template name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateName(pub String);

/// Marks a response produced from a handler error
///
/// Error types attach this from their `IntoResponse` implementation so the
/// innermost hook can count the failure by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerException {
    type_name: &'static str,
}

impl HandlerException {
    /// Exception named after the short type name of `E`
    pub fn of<E: ?Sized>() -> Self {
        Self {
            type_name: labels::exception_type_name::<E>(),
        }
    }

    /// Exception with an explicit type label
    pub fn named(type_name: &'static str) -> Self {
        Self { type_name }
    }

    /// Type label for the exception counters
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Attach this marker to a response
    pub fn attach(self, mut response: Response) -> Response {
        response.extensions_mut().insert(self);
        response
    }
}

/// Response facts the innermost response hook records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub charset: Option<String>,
    /// Exact body size, `None` for streaming bodies
    pub body_bytes: Option<u64>,
    pub template: Option<String>,
}

impl ResponseInfo {
    /// Minimal response description, mostly for tests and non-Axum callers
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            charset: None,
            body_bytes: Some(0),
            template: None,
        }
    }

    /// Extract response facts without touching the body
    pub fn from_response(response: &Response) -> Self {
        let charset = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(charset_of);

        Self {
            status: response.status(),
            charset,
            body_bytes: response.body().size_hint().exact(),
            template: response
                .extensions()
                .get::<TemplateName>()
                .map(|t| t.0.clone()),
        }
    }
}

/// `charset` parameter of a Content-Type value, lowercased
fn charset_of(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"').to_ascii_lowercase())
        .filter(|value| !value.is_empty())
}
