//! Bearer-token authentication for the chat and agent routes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use relaychat_core::config::Config;

use crate::problem::ProblemDetails;
use crate::state::GatewayState;

/// How callers are authenticated.
#[derive(Debug, Clone)]
pub enum AuthPolicy {
    /// Every request is accepted as anonymous.
    Open,
    /// `Authorization: Bearer <token>` must match.
    Token(String),
}

impl AuthPolicy {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        match config.auth_mode() {
            "none" => Ok(AuthPolicy::Open),
            "token" => config.auth_token().map(AuthPolicy::Token).ok_or_else(|| {
                anyhow::anyhow!("gateway.auth.mode is \"token\" but no token is configured")
            }),
            other => anyhow::bail!("unknown gateway auth mode: {other}"),
        }
    }
}

/// The authenticated caller, attached to each request as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".into(),
        }
    }
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

fn authenticate(policy: &AuthPolicy, headers: &HeaderMap) -> Result<Principal, &'static str> {
    match policy {
        AuthPolicy::Open => Ok(Principal::anonymous()),
        AuthPolicy::Token(expected) => match bearer_token(headers) {
            Some(token) if constant_time_eq(token, expected) => Ok(Principal {
                subject: "token".into(),
            }),
            Some(_) => Err("Invalid token"),
            None => Err("Bearer token required"),
        },
    }
}

/// Axum middleware rejecting unauthenticated requests with a 401 problem.
pub async fn require_auth(
    State(state): State<Arc<GatewayState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&state.auth, request.headers()) {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(reason) => {
            debug!(path = %request.uri().path(), reason, "Rejected unauthenticated request");
            let mut response = ProblemDetails::unauthorized(reason).into_response();
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("hello", "hello"));
        assert!(!constant_time_eq("hello", "world"));
        assert!(!constant_time_eq("hello", "hell"));
    }

    #[test]
    fn test_open_policy_is_anonymous() {
        let principal = authenticate(&AuthPolicy::Open, &HeaderMap::new()).unwrap();
        assert_eq!(principal, Principal::anonymous());
    }

    #[test]
    fn test_token_policy() {
        let policy = AuthPolicy::Token("s3cret".into());
        assert!(authenticate(&policy, &headers_with("Bearer s3cret")).is_ok());
        assert!(authenticate(&policy, &headers_with("bearer s3cret")).is_ok());
        assert_eq!(
            authenticate(&policy, &headers_with("Bearer nope")),
            Err("Invalid token")
        );
        assert_eq!(
            authenticate(&policy, &headers_with("Basic s3cret")),
            Err("Bearer token required")
        );
        assert_eq!(
            authenticate(&policy, &HeaderMap::new()),
            Err("Bearer token required")
        );
    }

    #[test]
    fn test_policy_from_config() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "gateway": { "port": 1, "auth": { "mode": "token", "token": "abc" } }
        }))
        .unwrap();
        assert!(matches!(AuthPolicy::from_config(&config).unwrap(), AuthPolicy::Token(t) if t == "abc"));

        let missing: Config = serde_json::from_value(serde_json::json!({
            "gateway": { "auth": { "mode": "token" } }
        }))
        .unwrap();
        assert!(AuthPolicy::from_config(&missing).is_err());

        assert!(matches!(
            AuthPolicy::from_config(&Config::default()).unwrap(),
            AuthPolicy::Open
        ));
    }
}
