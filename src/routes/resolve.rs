use axum::{body::Bytes, extract::State, Json};

use crate::{
    error::ApiError,
    models::{EntityResolution, EntityResolutionRequest},
    state::AppState,
};

use super::parse_json;

pub async fn handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Vec<EntityResolution>>, ApiError> {
    let request: EntityResolutionRequest = parse_json(&body)?;
    tracing::debug!(identifiers = request.identifiers.len(), "resolution request");

    let resolutions = state.resolver.resolve(&request).await?;

    Ok(Json(resolutions))
}
