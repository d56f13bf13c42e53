use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    engine::{EngineError, PolicyEngine, RawDecision},
    input::InputDocument,
};

enum MockOutcome {
    Result(Value),
    DecisionFailure(String),
}

/// In-process stand-in for the policy engine. Returns a canned result,
/// optionally after a delay, and records every input document it receives.
pub struct MockEngine {
    outcome: MockOutcome,
    delay: Option<Duration>,
    inputs: Mutex<Vec<InputDocument>>,
    stopped: AtomicBool,
}

impl MockEngine {
    pub fn returning(result: Value) -> Self {
        Self::with_outcome(MockOutcome::Result(result))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_outcome(MockOutcome::DecisionFailure(message.into()))
    }

    fn with_outcome(outcome: MockOutcome) -> Self {
        Self {
            outcome,
            delay: None,
            inputs: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Input documents seen so far, in call order.
    pub fn inputs(&self) -> Vec<InputDocument> {
        self.inputs
            .lock()
            .map(|inputs| inputs.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.inputs.lock().map(|inputs| inputs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PolicyEngine for MockEngine {
    async fn evaluate(&self, input: InputDocument) -> Result<RawDecision, EngineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Stopped);
        }

        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(input);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.outcome {
            MockOutcome::Result(result) => Ok(RawDecision {
                id: "R-0".to_string(),
                result: result.clone(),
            }),
            MockOutcome::DecisionFailure(message) => {
                Err(EngineError::DecisionFailed(message.clone()))
            }
        }
    }

    async fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}
