use axum::http::StatusCode;
use thiserror::Error;

use crate::cache::StorageError;

use super::fetch::{FetchError, ResponseKind};

/// Failures observed by the gateway lifecycle hooks.
///
/// Only [`GatewayError::FallbackMissing`] ever reaches the caller of
/// `intercept`; the other variants are logged and recovered where they occur.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to prefetch `{path}` into cache `{label}`: {reason}")]
    InstallFetch {
        label: String,
        path: String,
        reason: String,
    },
    #[error("failed to delete cache `{label}`: {source}")]
    ActivationDelete {
        label: String,
        #[source]
        source: StorageError,
    },
    #[error("origin fetch for `{url}` failed: {source}")]
    OriginFetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("origin response for `{url}` is unusable (status {status}, kind {})", .kind.as_str())]
    InvalidResponse {
        url: String,
        status: StatusCode,
        kind: ResponseKind,
    },
    #[error("fallback resource `{path}` is not cached")]
    FallbackMissing { path: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl GatewayError {
    pub fn install_fetch(
        label: impl Into<String>,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InstallFetch {
            label: label.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn fallback_missing(path: impl Into<String>) -> Self {
        Self::FallbackMissing { path: path.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_response_message_names_status_and_kind() {
        let err = GatewayError::InvalidResponse {
            url: "/missing.js".to_string(),
            status: StatusCode::NOT_FOUND,
            kind: ResponseKind::Basic,
        };
        let message = err.to_string();
        assert!(message.contains("/missing.js"));
        assert!(message.contains("404"));
        assert!(message.contains("basic"));
    }

    #[test]
    fn activation_delete_exposes_storage_source() {
        let err = GatewayError::ActivationDelete {
            label: "v1".to_string(),
            source: StorageError::backend("disk quota"),
        };
        let source = std::error::Error::source(&err).expect("source error");
        assert!(source.to_string().contains("disk quota"));
    }
}
