use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, header};
use bytes::{Bytes, BytesMut};
use reqwest::{Client, Url};
use tracing::debug;

use crate::gateway::{
    FetchError, FetchedResponse, GatewayRequest, GatewayResponse, OriginFetch, ResponseKind,
};
use crate::infra::error::InfraError;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::HOST,
    header::TRANSFER_ENCODING,
    header::TE,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

/// Request headers dropped from cacheable fetches. The stored entry must be the
/// complete, identity-encoded representation shared by every client.
const CACHE_VARIANT: [HeaderName; 7] = [
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_MATCH,
    header::IF_UNMODIFIED_SINCE,
    header::IF_RANGE,
    header::RANGE,
    header::ACCEPT_ENCODING,
];

/// Origin reached over HTTP(S) with `reqwest`.
///
/// Redirects are followed; a response whose final URL left the base origin is
/// classified as [`ResponseKind::Cors`] and will not be cached.
#[derive(Clone, Debug)]
pub struct HttpOrigin {
    client: Client,
    base: Url,
    max_body_bytes: usize,
}

impl HttpOrigin {
    pub fn new(base: Url, timeout: Duration, max_body_bytes: usize) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::client(err.to_string()))?;
        Ok(Self {
            client,
            base,
            max_body_bytes,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("cachegate/", env!("CARGO_PKG_VERSION"))
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Join an origin-relative request path onto the base URL.
    ///
    /// Only paths starting with a single `/` are accepted, and the result must
    /// stay on the base origin; `//host/x` and `/\host` would otherwise leave it.
    fn resolve(&self, url: &str) -> Result<Url, FetchError> {
        if !url.starts_with('/') || url.starts_with("//") || url.contains('\\') {
            return Err(FetchError::invalid_url(url, "not an origin-relative path"));
        }

        let resolved = self
            .base
            .join(url)
            .map_err(|err| FetchError::invalid_url(url, err.to_string()))?;
        if resolved.origin() != self.base.origin() {
            return Err(FetchError::invalid_url(url, "resolves outside the origin"));
        }
        Ok(resolved)
    }

    fn classify(&self, final_url: &Url) -> ResponseKind {
        if final_url.origin() == self.base.origin() {
            ResponseKind::Basic
        } else {
            ResponseKind::Cors
        }
    }

    async fn read_body(
        &self,
        url: &str,
        mut response: reqwest::Response,
    ) -> Result<Bytes, FetchError> {
        let too_large = || FetchError::BodyTooLarge {
            url: url.to_string(),
            limit: self.max_body_bytes,
        };

        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(too_large());
        }

        let mut buffer = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| FetchError::transport(url, err.to_string()))?
        {
            if buffer.len() + chunk.len() > self.max_body_bytes {
                return Err(too_large());
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

#[async_trait]
impl OriginFetch for HttpOrigin {
    async fn fetch(&self, request: &GatewayRequest) -> Result<FetchedResponse, FetchError> {
        let target = self.resolve(&request.url)?;

        let mut builder = self
            .client
            .request(request.method.clone(), target)
            .headers(request_headers(
                &request.headers,
                request.is_cacheable_method(),
            ));
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| FetchError::transport(&request.url, err.to_string()))?;

        let kind = self.classify(response.url());
        let status = response.status();
        let headers = forwardable(response.headers());
        debug!(
            url = %request.url,
            status = status.as_u16(),
            kind = kind.as_str(),
            "origin responded"
        );

        let body = self.read_body(&request.url, response).await?;
        Ok(FetchedResponse {
            kind,
            response: GatewayResponse {
                status,
                headers,
                body,
            },
        })
    }
}

fn request_headers(headers: &HeaderMap, cacheable: bool) -> HeaderMap {
    let mut forwarded = forwardable(headers);
    if cacheable {
        for name in &CACHE_VARIANT {
            forwarded.remove(name);
        }
    }
    forwarded
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in &HOP_BY_HOP {
        forwarded.remove(name);
    }
    forwarded
}
