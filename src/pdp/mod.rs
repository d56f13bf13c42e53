//! Entitlement policy decision point.
//!
//! A request names a primary entity, the secondary entities acting for it and
//! optional IdP context. [`EntitlementPdp`] turns that into an engine input
//! document, evaluates the entitlement rule set and decodes the attribute
//! grants the rules produced.

pub mod decision;
pub mod engine;
pub mod engine_config;
pub mod input;
pub mod mock;
pub mod opa;

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::timeout;

use crate::models::EntityEntitlement;

use self::{
    decision::{decode_decision, DecodeError},
    engine::{EngineError, PolicyEngine},
    input::{build_input_document, InputDocumentError},
};

#[derive(Debug, Error)]
pub enum PdpError {
    #[error("primary entity id is required")]
    EmptyPrimaryEntity,

    #[error("constructing decision input document")]
    Input(#[from] InputDocumentError),

    #[error("evaluating entitlement policy")]
    Engine(#[from] EngineError),

    #[error("deserializing policy engine result")]
    Decode(#[from] DecodeError),
}

pub struct EntitlementPdp {
    engine: Arc<dyn PolicyEngine>,
    decision_timeout: Duration,
}

impl EntitlementPdp {
    pub fn new(engine: Arc<dyn PolicyEngine>, decision_timeout: Duration) -> Self {
        Self {
            engine,
            decision_timeout,
        }
    }

    pub fn engine(&self) -> &Arc<dyn PolicyEngine> {
        &self.engine
    }

    pub async fn apply_entitlement_policy(
        &self,
        primary_entity: &str,
        secondary_entities: &[String],
        context_json: &str,
    ) -> Result<Vec<EntityEntitlement>, PdpError> {
        if primary_entity.trim().is_empty() {
            return Err(PdpError::EmptyPrimaryEntity);
        }

        let input = build_input_document(primary_entity, secondary_entities, context_json)?;

        let raw = timeout(self.decision_timeout, self.engine.evaluate(input))
            .await
            .map_err(|_| EngineError::Cancelled(self.decision_timeout))??;

        let decision = decode_decision(&raw)?;
        tracing::debug!(
            decision_id = %decision.id,
            entitlements = decision.result.len(),
            "decoded entitlement decision"
        );

        Ok(decision.result)
    }
}
