use axum::{extract::State, http::StatusCode};

use crate::state::AppState;

pub async fn handler(State(state): State<AppState>) -> StatusCode {
    if state.lifecycle.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
