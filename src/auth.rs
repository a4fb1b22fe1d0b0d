//! Authorization for the metrics endpoint
//!
//! Malformed credentials are a client error (400), well-formed but wrong
//! credentials are 401 with an empty body. Secrets are compared in constant
//! time with respect to their content.

use crate::config::AuthConfig;
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use subtle::ConstantTimeEq;

/// Realm announced on basic-auth challenges
pub const BASIC_REALM: &str = "Basic realm=\"metrics\"";

/// Access policy of the metrics endpoint
#[derive(Clone, PartialEq, Eq, Default)]
pub enum MetricsAuth {
    #[default]
    Open,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

impl std::fmt::Debug for MetricsAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Bearer { .. } => write!(f, "Bearer {{ token: <redacted> }}"),
            Self::Basic { username, .. } => {
                write!(f, "Basic {{ username: {:?}, password: <redacted> }}", username)
            }
        }
    }
}

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// Header missing, wrong scheme or undecodable credentials
    Malformed(&'static str),
    /// Well-formed bearer token that does not match
    WrongToken,
    /// Well-formed basic credentials that do not match
    WrongCredentials,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            Self::Malformed(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            Self::WrongToken => StatusCode::UNAUTHORIZED.into_response(),
            Self::WrongCredentials => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, HeaderValue::from_static(BASIC_REALM))],
            )
                .into_response(),
        }
    }
}

fn secrets_match(given: &str, expected: &str) -> bool {
    given.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Split `Authorization` into scheme and credentials
fn authorization(headers: &HeaderMap) -> Result<(&str, &str), AuthRejection> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthRejection::Malformed("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AuthRejection::Malformed("Authorization header is not valid ASCII"))?
        .trim();
    if value.is_empty() {
        return Err(AuthRejection::Malformed("Empty Authorization header"));
    }
    match value.split_once(' ') {
        Some((scheme, credentials)) => Ok((scheme, credentials.trim())),
        None => Ok((value, "")),
    }
}

impl MetricsAuth {
    pub fn from_config(config: Option<&AuthConfig>) -> Self {
        let Some(config) = config else {
            return Self::Open;
        };
        if let Some(token) = &config.bearer_token {
            return Self::Bearer {
                token: token.clone(),
            };
        }
        match (&config.username, &config.password) {
            (Some(username), Some(password)) => Self::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => Self::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check the request headers against this policy
    pub fn check(&self, headers: &HeaderMap) -> Result<(), AuthRejection> {
        match self {
            Self::Open => Ok(()),
            Self::Bearer { token } => {
                let (scheme, given) = authorization(headers)?;
                if !scheme.eq_ignore_ascii_case("bearer") {
                    return Err(AuthRejection::Malformed("Expected Bearer authorization"));
                }
                if given.is_empty() {
                    return Err(AuthRejection::Malformed("Empty bearer token"));
                }
                if secrets_match(given, token) {
                    Ok(())
                } else {
                    Err(AuthRejection::WrongToken)
                }
            }
            Self::Basic { username, password } => {
                let (scheme, encoded) = authorization(headers)?;
                if !scheme.eq_ignore_ascii_case("basic") {
                    return Err(AuthRejection::Malformed("Expected Basic authorization"));
                }
                let decoded = STANDARD
                    .decode(encoded)
                    .map_err(|_| AuthRejection::Malformed("Invalid base64 in Basic credentials"))?;
                let decoded = String::from_utf8(decoded)
                    .map_err(|_| AuthRejection::Malformed("Basic credentials are not UTF-8"))?;
                let (given_user, given_password) = decoded
                    .split_once(':')
                    .ok_or(AuthRejection::Malformed("Basic credentials lack ':'"))?;

                // Evaluate both comparisons before combining them
                let user_ok = secrets_match(given_user, username);
                let password_ok = secrets_match(given_password, password);
                if user_ok & password_ok {
                    Ok(())
                } else {
                    Err(AuthRejection::WrongCredentials)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn bearer() -> MetricsAuth {
        MetricsAuth::Bearer {
            token: "top_secret_string".into(),
        }
    }

    fn basic() -> MetricsAuth {
        MetricsAuth::Basic {
            username: "scraper".into(),
            password: "hunter2".into(),
        }
    }

    #[test]
    fn test_open_allows_everything() {
        assert_eq!(MetricsAuth::Open.check(&HeaderMap::new()), Ok(()));
        assert_eq!(MetricsAuth::Open.check(&headers("Bearer junk")), Ok(()));
    }

    #[test]
    fn test_bearer_outcomes() {
        let auth = bearer();
        assert_eq!(auth.check(&headers("Bearer top_secret_string")), Ok(()));
        assert_eq!(
            auth.check(&headers("Bearer incorrect_value")),
            Err(AuthRejection::WrongToken)
        );
        assert!(matches!(
            auth.check(&headers("WRONG_TYPE top_secret_string")),
            Err(AuthRejection::Malformed(_))
        ));
        assert!(matches!(
            auth.check(&headers("Bearer")),
            Err(AuthRejection::Malformed(_))
        ));
        assert!(matches!(
            auth.check(&HeaderMap::new()),
            Err(AuthRejection::Malformed(_))
        ));
    }

    #[test]
    fn test_basic_outcomes() {
        let auth = basic();
        let good = STANDARD.encode("scraper:hunter2");
        let bad = STANDARD.encode("scraper:letmein");
        let no_colon = STANDARD.encode("scraper");

        assert_eq!(auth.check(&headers(&format!("Basic {}", good))), Ok(()));
        assert_eq!(
            auth.check(&headers(&format!("Basic {}", bad))),
            Err(AuthRejection::WrongCredentials)
        );
        assert!(matches!(
            auth.check(&headers(&format!("Basic {}", no_colon))),
            Err(AuthRejection::Malformed(_))
        ));
        assert!(matches!(
            auth.check(&headers("Basic !!!not-base64")),
            Err(AuthRejection::Malformed(_))
        ));
        assert!(matches!(
            auth.check(&headers(&format!("Bearer {}", good))),
            Err(AuthRejection::Malformed(_))
        ));
    }

    #[test]
    fn test_rejection_responses() {
        assert_eq!(
            AuthRejection::Malformed("x").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        let wrong_token = AuthRejection::WrongToken.into_response();
        assert_eq!(wrong_token.status(), StatusCode::UNAUTHORIZED);
        assert!(wrong_token.headers().get(header::WWW_AUTHENTICATE).is_none());

        let wrong_credentials = AuthRejection::WrongCredentials.into_response();
        assert_eq!(
            wrong_credentials.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            BASIC_REALM
        );
    }

    #[test]
    fn test_from_config() {
        assert!(MetricsAuth::from_config(None).is_open());
        let config = AuthConfig {
            bearer_token: Some("t".into()),
            username: None,
            password: None,
        };
        assert_eq!(
            MetricsAuth::from_config(Some(&config)),
            MetricsAuth::Bearer { token: "t".into() }
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?} {:?}", bearer(), basic());
        assert!(!rendered.contains("top_secret_string"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("scraper"));
    }
}
