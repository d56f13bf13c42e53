use axum::{body::Bytes, extract::State, Json};

use crate::{
    error::ApiError,
    models::{EntitlementsRequest, EntityEntitlement},
    pdp::{engine::EngineError, PdpError},
    state::AppState,
};

use super::parse_json;

pub async fn handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Vec<EntityEntitlement>>, ApiError> {
    if !state.lifecycle.is_ready() {
        return Err(PdpError::Engine(EngineError::NotReady).into());
    }

    let request: EntitlementsRequest = parse_json(&body)?;
    tracing::debug!(
        primary_entity = %request.primary_entity_id,
        secondary_entities = request.secondary_entity_ids.len(),
        has_context = request.context_object.is_some(),
        "entitlement request"
    );

    let entitlements = state
        .pdp
        .apply_entitlement_policy(
            &request.primary_entity_id,
            &request.secondary_entity_ids,
            request.context_object.as_deref().unwrap_or_default(),
        )
        .await?;

    Ok(Json(entitlements))
}
