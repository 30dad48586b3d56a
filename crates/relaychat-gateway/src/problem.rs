//! Failure classification and `application/problem+json` responses.

use std::error::Error as StdError;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Map, Value, json};

use relaychat_core::config::Profile;
use relaychat_core::error::{FailureKind, InputError};
use relaychat_runtime::RuntimeError;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// A structured error body. The same title/detail pair feeds the in-stream
/// `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(status: StatusCode, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            problem_type: "about:blank".into(),
            title: title.into(),
            status: status.as_u16(),
            detail: detail.into(),
            extensions: Map::new(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found", detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized", detail)
    }

    pub fn with_extension(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.to_string(), value.into());
        self
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Text carried by the in-stream `error` frame.
    pub fn stream_message(&self) -> String {
        self.detail.clone()
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::to_vec(&self).unwrap_or_else(|_| {
            json!({ "title": self.title, "status": self.status })
                .to_string()
                .into_bytes()
        });
        (status, [(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE)], body).into_response()
    }
}

/// Maps any error to a caller-safe [`ProblemDetails`].
///
/// Outside the development profile only client-input failures carry their
/// own text; everything else gets a fixed message per kind.
#[derive(Debug, Clone, Copy)]
pub struct ErrorTranslator {
    profile: Profile,
}

impl ErrorTranslator {
    pub fn new(profile: Profile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Classify by walking the `source()` chain for a known error type.
    pub fn classify(err: &(dyn StdError + 'static)) -> FailureKind {
        let mut current = Some(err);
        while let Some(e) = current {
            if e.is::<InputError>() {
                return FailureKind::ClientInput;
            }
            if let Some(runtime) = e.downcast_ref::<RuntimeError>() {
                return runtime.failure_kind();
            }
            if let Some(http) = e.downcast_ref::<reqwest::Error>() {
                if http.is_timeout() || http.is_connect() {
                    return FailureKind::UpstreamTransient;
                }
            }
            if e.is::<tokio::time::error::Elapsed>() {
                return FailureKind::UpstreamTransient;
            }
            current = e.source();
        }
        FailureKind::Unclassified
    }

    pub fn translate(&self, err: &(dyn StdError + 'static)) -> ProblemDetails {
        let kind = Self::classify(err);
        let dev = self.profile.is_development();

        let problem = match kind {
            FailureKind::ClientInput => {
                let input = find::<InputError>(err);
                let detail = match input {
                    Some(input) => input.to_string(),
                    None => err.to_string(),
                };
                let problem = ProblemDetails::new(StatusCode::BAD_REQUEST, "Invalid request", detail);
                match input {
                    Some(InputError::InvalidImage { index, .. }) => {
                        problem.with_extension("index", *index)
                    }
                    _ => problem,
                }
            }
            FailureKind::UpstreamAuth => ProblemDetails::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Agent runtime configuration error",
                if dev {
                    error_chain(err)
                } else {
                    "The agent service is not configured correctly.".to_string()
                },
            ),
            FailureKind::UpstreamTransient => ProblemDetails::new(
                StatusCode::BAD_GATEWAY,
                "Agent runtime unavailable",
                if dev {
                    error_chain(err)
                } else {
                    "The agent service is temporarily unavailable. Please retry.".to_string()
                },
            ),
            FailureKind::Unclassified => ProblemDetails::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                if dev {
                    error_chain(err)
                } else {
                    "An unexpected error occurred.".to_string()
                },
            ),
        };

        problem
            .with_extension("kind", kind.as_str())
            .with_extension("retryable", kind == FailureKind::UpstreamTransient)
    }
}

fn find<'a, T: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

/// `outer: inner: root` rendering of an error and its causes.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        let text = e.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        current = e.source();
    }
    parts.join(": ")
}
