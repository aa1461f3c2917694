//! Conversions between axum messages and gateway descriptors.
//!
//! Request bodies are collected once into [`Bytes`] so the gateway can hand
//! the same payload to the origin without re-reading the stream.

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    response::Response,
};
use http_body_util::{BodyExt, Limited};
use thiserror::Error;

use crate::gateway::{GatewayRequest, GatewayResponse, InterceptOutcome, Intercepted};

pub const OUTCOME_HEADER: HeaderName = HeaderName::from_static("x-cachegate-outcome");

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("failed to buffer request body: {0}")]
    Read(String),
}

pub async fn into_gateway_request(
    request: Request<Body>,
    limit: usize,
) -> Result<GatewayRequest, BufferError> {
    let (parts, body) = request.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let body = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.is::<http_body_util::LengthLimitError>() => {
            return Err(BufferError::TooLarge { limit });
        }
        Err(err) => return Err(BufferError::Read(err.to_string())),
    };

    Ok(GatewayRequest {
        method: parts.method,
        url,
        headers: parts.headers,
        body,
    })
}

pub fn into_response(intercepted: Intercepted) -> Response {
    let Intercepted { response, outcome } = intercepted;
    let mut rebuilt = gateway_response(response);
    rebuilt
        .headers_mut()
        .insert(OUTCOME_HEADER, outcome_value(outcome));
    rebuilt
}

fn gateway_response(response: GatewayResponse) -> Response {
    let GatewayResponse {
        status,
        headers,
        body,
    } = response;
    let mut rebuilt = Response::new(Body::from(body));
    *rebuilt.status_mut() = status;
    *rebuilt.headers_mut() = headers;
    rebuilt
}

fn outcome_value(outcome: InterceptOutcome) -> HeaderValue {
    HeaderValue::from_static(outcome.as_str())
}
