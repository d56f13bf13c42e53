mod entitlements;
mod healthz;
mod resolve;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use serde::de::DeserializeOwned;

use crate::{
    error::ApiError, middleware::request_span::request_span_middleware, state::AppState,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz::handler))
        .route("/entitlements", post(entitlements::handler))
        .route("/resolve", post(resolve::handler))
        .layer(middleware::from_fn(request_span_middleware))
        .with_state(state)
}

/// Bodies are JSON whatever the `Content-Type` says.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "could not parse request body");
        ApiError::BadRequest(format!("invalid request body: {e}"))
    })
}
