use std::sync::atomic::{AtomicBool, Ordering};

/// Process readiness. Starts out `Starting` and moves to `Ready` exactly once,
/// after the policy engine has come up. It never moves back.
#[derive(Debug, Default)]
pub struct Lifecycle {
    ready: AtomicBool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Ready,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        if self.ready.load(Ordering::Acquire) {
            Phase::Ready
        } else {
            Phase::Starting
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    /// Returns `true` for the call that performed the transition.
    pub fn mark_ready(&self) -> bool {
        let transitioned = self
            .ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if transitioned {
            tracing::info!("service is ready");
        }
        transitioned
    }
}
