use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// A chat request that failed validation before any upstream work started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("message is {len} characters, the limit is {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("{count} image attachments supplied, the limit is {max}")]
    TooManyImages { count: usize, max: usize },

    #[error("image attachment {index} is invalid: {reason}")]
    InvalidImage { index: usize, reason: String },
}

/// Coarse classification of a failure, shared by the stream error frame and
/// the problem response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ClientInput,
    UpstreamAuth,
    UpstreamTransient,
    Unclassified,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ClientInput => "client_input",
            FailureKind::UpstreamAuth => "upstream_auth",
            FailureKind::UpstreamTransient => "upstream_transient",
            FailureKind::Unclassified => "unclassified",
        }
    }
}
