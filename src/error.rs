use std::{error::Error, fmt};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{
    pdp::{engine::EngineError, PdpError},
    resolve::ResolveError,
};

const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// HTTP-facing error type.
///
/// Each variant maps to an HTTP status code and produces a JSON response
/// body of the form `{"error": "<kind>", "message": "<details>"}`. Server-side
/// failures carry a generic message; their cause chain goes to the log.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
    ServiceUnavailable(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad Request: {msg}"),
            ApiError::Internal(msg) => write!(f, "Internal Server Error: {msg}"),
            ApiError::ServiceUnavailable(msg) => write!(f, "Service Unavailable: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_kind) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
        };

        let message = match &self {
            ApiError::BadRequest(msg)
            | ApiError::Internal(msg)
            | ApiError::ServiceUnavailable(msg) => msg.clone(),
        };

        let body = json!({
            "error": error_kind,
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}

/// Render an error and all of its sources as `outer: inner: root`.
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

fn internal(context: &'static str, err: &(dyn Error + 'static)) -> ApiError {
    tracing::error!(error = %error_chain(err), "{context}");
    ApiError::Internal(INTERNAL_ERROR_MESSAGE.to_string())
}

impl From<PdpError> for ApiError {
    fn from(err: PdpError) -> Self {
        match &err {
            PdpError::EmptyPrimaryEntity => {
                ApiError::BadRequest("primary_entity_id is required".to_string())
            }
            PdpError::Input(input) if input.is_client_error() => {
                tracing::warn!(error = %error_chain(&err), "rejected entitlement context");
                ApiError::BadRequest(format!(
                    "invalid entitlement_context_obj: {}",
                    error_chain(input)
                ))
            }
            PdpError::Engine(EngineError::NotReady) => {
                ApiError::ServiceUnavailable("policy engine is starting".to_string())
            }
            _ => internal("entitlement decision failed", &err),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        if err.is_client_error() {
            tracing::warn!(error = %err, "rejected resolution request");
            ApiError::BadRequest(err.to_string())
        } else {
            internal("entity resolution failed", &err)
        }
    }
}
