//! Origin fetch capability injected into the gateway.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use super::message::{GatewayRequest, GatewayResponse};

/// How the origin response relates to the requesting origin.
///
/// Only [`ResponseKind::Basic`] responses are cached. The bundled origins
/// produce `Basic` or `Cors`; `Opaque` is available to [`OriginFetch`]
/// implementations that cannot read the response they relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// Same-origin response, fully readable.
    Basic,
    /// Cross-origin response, for example after a redirect to another host.
    Cors,
    /// Cross-origin response whose content cannot be inspected.
    Opaque,
}

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Cors => "cors",
            Self::Opaque => "opaque",
        }
    }
}

/// A fully buffered origin response.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub kind: ResponseKind,
    pub response: GatewayResponse,
}

impl FetchedResponse {
    pub fn basic(response: GatewayResponse) -> Self {
        Self {
            kind: ResponseKind::Basic,
            response,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("request to `{url}` failed: {message}")]
    Transport { url: String, message: String },
    #[error("response body for `{url}` exceeds {limit} bytes")]
    BodyTooLarge { url: String, limit: usize },
}

impl FetchError {
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.into(),
        }
    }
}

/// Retrieves resources from the origin behind the gateway.
#[async_trait]
pub trait OriginFetch: Send + Sync {
    async fn fetch(&self, request: &GatewayRequest) -> Result<FetchedResponse, FetchError>;
}
