use thiserror::Error;

use relaychat_core::error::FailureKind;

/// Failures reported by, or while talking to, the agent runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("runtime rejected credentials ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("runtime misconfigured: {0}")]
    Configuration(String),

    #[error("runtime request timed out")]
    Timeout,

    #[error("runtime unreachable: {0}")]
    Unavailable(String),

    #[error("runtime error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("runtime rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("run failed: {message}")]
    RunFailed {
        code: Option<String>,
        message: String,
    },

    #[error("malformed runtime response: {0}")]
    Protocol(String),
}

impl RuntimeError {
    /// Map an unsuccessful HTTP status to an error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => RuntimeError::Unauthorized { status, message },
            408 | 429 | 500..=599 => RuntimeError::Upstream { status, message },
            _ => RuntimeError::Rejected { status, message },
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RuntimeError::Unauthorized { .. } | RuntimeError::Configuration(_) => {
                FailureKind::UpstreamAuth
            }
            RuntimeError::Timeout | RuntimeError::Unavailable(_) | RuntimeError::Upstream { .. } => {
                FailureKind::UpstreamTransient
            }
            RuntimeError::RunFailed { code, .. } => match code.as_deref() {
                Some("rate_limit_exceeded" | "server_error" | "timeout") => {
                    FailureKind::UpstreamTransient
                }
                Some("invalid_api_key" | "unauthorized") => FailureKind::UpstreamAuth,
                _ => FailureKind::Unclassified,
            },
            RuntimeError::Rejected { .. } | RuntimeError::Protocol(_) => FailureKind::Unclassified,
        }
    }
}

impl From<reqwest::Error> for RuntimeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RuntimeError::Timeout
        } else if e.is_connect() {
            RuntimeError::Unavailable(e.to_string())
        } else if let Some(status) = e.status() {
            RuntimeError::from_status(status.as_u16(), e.to_string())
        } else if e.is_decode() {
            RuntimeError::Protocol(e.to_string())
        } else {
            RuntimeError::Unavailable(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            RuntimeError::from_status(401, String::new()),
            RuntimeError::Unauthorized { status: 401, .. }
        ));
        assert!(matches!(
            RuntimeError::from_status(503, String::new()),
            RuntimeError::Upstream { status: 503, .. }
        ));
        assert!(matches!(
            RuntimeError::from_status(429, String::new()),
            RuntimeError::Upstream { .. }
        ));
        assert!(matches!(
            RuntimeError::from_status(404, String::new()),
            RuntimeError::Rejected { status: 404, .. }
        ));
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            RuntimeError::Configuration("no endpoint".into()).failure_kind(),
            FailureKind::UpstreamAuth
        );
        assert_eq!(RuntimeError::Timeout.failure_kind(), FailureKind::UpstreamTransient);
        assert_eq!(
            RuntimeError::RunFailed {
                code: Some("server_error".into()),
                message: "oops".into()
            }
            .failure_kind(),
            FailureKind::UpstreamTransient
        );
        assert_eq!(
            RuntimeError::RunFailed {
                code: None,
                message: "content filtered".into()
            }
            .failure_kind(),
            FailureKind::Unclassified
        );
        assert_eq!(
            RuntimeError::Protocol("bad json".into()).failure_kind(),
            FailureKind::Unclassified
        );
    }
}
