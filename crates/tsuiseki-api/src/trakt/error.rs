use thiserror::Error;

use crate::traits::{FailureKind, ServiceError};

/// Errors from the Trakt API client.
#[derive(Debug, Error)]
pub enum TraktError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ServiceError for TraktError {
    /// Bodies are read to completion before parsing, so `Http` only ever
    /// carries transport failures (connect, timeout, reset mid-body) and is
    /// always retryable. Unexpected JSON surfaces as `Parse`.
    fn kind(&self) -> FailureKind {
        match self {
            Self::Http(_) | Self::RateLimited { .. } => FailureKind::Network,
            Self::Api {
                status: 401 | 403, ..
            } => FailureKind::Auth,
            Self::Api {
                status: 408 | 429 | 500..=599,
                ..
            } => FailureKind::Network,
            Self::Api { .. } | Self::Parse(_) | Self::Config(_) => FailureKind::Malformed,
        }
    }
}
