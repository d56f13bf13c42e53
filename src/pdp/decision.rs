use serde::Deserialize;
use thiserror::Error;

use super::engine::RawDecision;
use crate::models::EntityEntitlement;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Decision {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Result", default)]
    pub result: Vec<EntityEntitlement>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("re-marshalling result document")]
    Marshal(#[source] serde_json::Error),

    #[error("deserialize final JSON result document")]
    Unmarshal(#[source] serde_json::Error),
}

/// Convert the engine's generic payload into a typed [`Decision`] by writing
/// it back out to bytes and reading it into the entitlement schema.
pub fn decode_decision(raw: &RawDecision) -> Result<Decision, DecodeError> {
    let bytes = serde_json::to_vec(raw).map_err(DecodeError::Marshal)?;
    tracing::trace!(document = %String::from_utf8_lossy(&bytes), "raw decision");
    serde_json::from_slice(&bytes).map_err(DecodeError::Unmarshal)
}
