//! HTTP front-end: every request outside `/_gateway/` goes through the gateway.

mod convert;
mod middleware;

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::get,
};

pub use convert::{BufferError, OUTCOME_HEADER, into_gateway_request, into_response};
pub use middleware::{RequestContext, log_responses, set_request_context};

use crate::{error::HttpError, gateway::CacheGateway};

#[derive(Clone)]
pub struct HttpState {
    pub gateway: Arc<CacheGateway>,
    /// Largest request body forwarded to the origin.
    pub max_body_bytes: usize,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/_gateway/health", get(health))
        .route("/_gateway/caches", get(list_caches))
        .fallback(intercept_request)
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn list_caches(State(state): State<HttpState>) -> Response {
    match state.gateway.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => HttpError::from_error(
            "infra::http::list_caches",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Cache storage unavailable",
            &err,
        )
        .into_response(),
    }
}

async fn intercept_request(State(state): State<HttpState>, request: Request<Body>) -> Response {
    let request = match into_gateway_request(request, state.max_body_bytes).await {
        Ok(request) => request,
        Err(err @ BufferError::TooLarge { .. }) => {
            return HttpError::from_error(
                "infra::http::intercept",
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                &err,
            )
            .into_response();
        }
        Err(err) => {
            return HttpError::from_error(
                "infra::http::intercept",
                StatusCode::BAD_REQUEST,
                "Request body could not be read",
                &err,
            )
            .into_response();
        }
    };

    match state.gateway.intercept(&request).await {
        Ok(intercepted) => into_response(intercepted),
        Err(err) => HttpError::from(err).into_response(),
    }
}
