use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::input::InputDocument;

/// Undecoded engine output. `result` is whatever the rule at the decision
/// path produced.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawDecision {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Result")]
    pub result: Value,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("policy engine initialization failed: {reason}")]
    Initialization {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("policy engine is not ready")]
    NotReady,

    #[error("policy engine unavailable")]
    Unavailable(#[source] reqwest::Error),

    #[error("policy engine decision failed: {0}")]
    DecisionFailed(String),

    #[error("policy decision cancelled after {0:?}")]
    Cancelled(Duration),

    #[error("policy engine has been stopped")]
    Stopped,
}

impl EngineError {
    pub(crate) fn initialization(reason: impl Into<String>) -> Self {
        Self::Initialization {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn initialization_caused_by<E>(reason: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Initialization {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// A policy engine that evaluates the entitlement rule set.
///
/// The decision path is fixed when the engine is built; callers only supply
/// the input document.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, input: InputDocument) -> Result<RawDecision, EngineError>;

    /// Stop the engine. Safe to call more than once; later calls are no-ops.
    async fn shutdown(&self);
}
