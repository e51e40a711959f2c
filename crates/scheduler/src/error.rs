//! Scheduler error types.

use thiserror::Error;

use farm_core::{CoreError, StepId};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("step not tracked: {0}")]
    StepNotTracked(StepId),

    #[error("step already dispatched: {0}")]
    AlreadyDispatched(StepId),

    #[error("step has no attempt in flight: {0}")]
    NotDispatched(StepId),

    /// The step's next grant is over the configured ceiling; it has been
    /// evicted and must be failed permanently.
    #[error(
        "step {step} at rung {rung} would need {permitted_secs}s, above the {ceiling_secs}s ceiling"
    )]
    RunTimeCeilingExceeded {
        step: StepId,
        rung: u32,
        permitted_secs: u64,
        ceiling_secs: u64,
    },

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SchedulerError {
    /// Whether the step is gone for good and should be reported as failed.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(self, SchedulerError::RunTimeCeilingExceeded { .. })
    }
}
