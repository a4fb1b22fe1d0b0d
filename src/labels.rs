//! Label value extraction
//!
//! Every value produced here comes from a small, bounded vocabulary so that
//! attacker-controlled input (a made-up HTTP method, a random path) can never
//! create new time series.

use axum::extract::MatchedPath;
use axum::http::{HeaderMap, Method, StatusCode, Uri};

/// Label used for methods outside the allow-list
pub const INVALID_METHOD: &str = "<invalid method>";

/// Label used before (or without) route resolution
pub const UNNAMED_VIEW: &str = "<unnamed view>";

/// Request transport for metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Https,
}

impl Transport {
    /// Classify a request from its URI and headers
    ///
    /// `X-Forwarded-Proto` is only consulted when `trust_forwarded_proto` is
    /// set, since any client can send it.
    pub fn detect(uri: &Uri, headers: &HeaderMap, trust_forwarded_proto: bool) -> Self {
        if uri.scheme_str() == Some("https") {
            return Transport::Https;
        }
        if trust_forwarded_proto {
            let forwarded = headers
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().eq_ignore_ascii_case("https"))
                .unwrap_or(false);
            if forwarded {
                return Transport::Https;
            }
        }
        Transport::Http
    }

    /// Convert transport to Prometheus label string
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Https => "https",
        }
    }
}

/// Map a request method onto the allow-list
///
/// Methods are compared case-sensitively, as HTTP defines them.
pub fn method_label(method: &Method) -> &'static str {
    match method.as_str() {
        "CONNECT" => "CONNECT",
        "DELETE" => "DELETE",
        "GET" => "GET",
        "HEAD" => "HEAD",
        "OPTIONS" => "OPTIONS",
        "PATCH" => "PATCH",
        "POST" => "POST",
        "PUT" => "PUT",
        "TRACE" => "TRACE",
        _ => INVALID_METHOD,
    }
}

/// Transport label for a secure/insecure flag
pub fn transport_label(is_secure: bool) -> &'static str {
    if is_secure {
        Transport::Https.as_str()
    } else {
        Transport::Http.as_str()
    }
}

/// Route template of the resolved handler, or the unnamed sentinel
pub fn view_label(matched: Option<&MatchedPath>) -> &str {
    matched.map(MatchedPath::as_str).unwrap_or(UNNAMED_VIEW)
}

/// Status code as a label value
pub fn status_label(status: StatusCode) -> String {
    status.as_u16().to_string()
}

/// Short type name of `E`, for exception-count labels
pub fn exception_type_name<E: ?Sized>() -> &'static str {
    short_type_name(std::any::type_name::<E>())
}

/// Strip module path and generic arguments from a Rust type name
///
/// `std::io::Error` becomes `Error`, `my_app::db::QueryError<u8>` becomes
/// `QueryError`.
pub fn short_type_name(full: &str) -> &str {
    let without_generics = full.split('<').next().unwrap_or(full);
    let base = without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics);
    base.trim_start_matches('&').trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use proptest::prelude::*;

    #[test]
    fn test_allow_listed_methods_pass_through() {
        for method in [
            Method::CONNECT,
            Method::DELETE,
            Method::GET,
            Method::HEAD,
            Method::OPTIONS,
            Method::PATCH,
            Method::POST,
            Method::PUT,
            Method::TRACE,
        ] {
            assert_eq!(method_label(&method), method.as_str());
        }
    }

    #[test]
    fn test_unknown_method_is_invalid() {
        let method = Method::from_bytes(b"PROPFIND").unwrap();
        assert_eq!(method_label(&method), INVALID_METHOD);
    }

    #[test]
    fn test_lowercase_method_is_invalid() {
        let method = Method::from_bytes(b"get").unwrap();
        assert_eq!(method_label(&method), INVALID_METHOD);
    }

    #[test]
    fn test_transport_from_scheme() {
        let headers = HeaderMap::new();
        let secure: Uri = "https://example.com/".parse().unwrap();
        let plain: Uri = "/relative".parse().unwrap();
        assert_eq!(Transport::detect(&secure, &headers, false), Transport::Https);
        assert_eq!(Transport::detect(&plain, &headers, false), Transport::Http);
    }

    #[test]
    fn test_forwarded_proto_requires_trust() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("HTTPS"));
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(Transport::detect(&uri, &headers, false), Transport::Http);
        assert_eq!(Transport::detect(&uri, &headers, true), Transport::Https);
    }

    #[test]
    fn test_transport_label_values() {
        assert_eq!(transport_label(true), "https");
        assert_eq!(transport_label(false), "http");
    }

    #[test]
    fn test_view_label_without_route() {
        assert_eq!(view_label(None), UNNAMED_VIEW);
    }

    #[test]
    fn test_status_label() {
        assert_eq!(status_label(StatusCode::OK), "200");
        assert_eq!(status_label(StatusCode::IM_A_TEAPOT), "418");
    }

    #[test]
    fn test_short_type_names() {
        assert_eq!(short_type_name("std::io::Error"), "Error");
        assert_eq!(short_type_name("my_app::db::QueryError<u8>"), "QueryError");
        assert_eq!(short_type_name("&str"), "str");
        assert_eq!(short_type_name("Plain"), "Plain");
        assert_eq!(exception_type_name::<std::fmt::Error>(), "Error");
    }

    proptest! {
        #[test]
        fn prop_method_label_is_bounded_and_stable(raw in "[A-Za-z]{1,12}") {
            let method = Method::from_bytes(raw.as_bytes()).unwrap();
            let first = method_label(&method);
            let second = method_label(&method);
            prop_assert_eq!(first, second);
            if first != INVALID_METHOD {
                prop_assert_eq!(first, raw.as_str());
            }
        }

        #[test]
        fn prop_transport_detection_is_idempotent(secure in any::<bool>(), trust in any::<bool>()) {
            let uri: Uri = if secure { "https://h/" } else { "http://h/" }.parse().unwrap();
            let headers = HeaderMap::new();
            let first = Transport::detect(&uri, &headers, trust);
            prop_assert_eq!(first, Transport::detect(&uri, &headers, trust));
            prop_assert_eq!(first == Transport::Https, secure);
        }
    }
}
