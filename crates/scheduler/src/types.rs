use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use farm_core::{BuildId, Step, StepId};

use crate::ladder::{ResourceGrant, Rung};
use crate::step_info::StepInfo;

/// How a dispatched attempt ended, as reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// The build itself failed (or a dependency did). Not a resource problem.
    LogicalFailure,
    /// Killed for exceeding its grant: timeout, or OOM on a bounded executor.
    ResourceExhausted,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "success"),
            AttemptOutcome::LogicalFailure => write!(f, "logical failure"),
            AttemptOutcome::ResourceExhausted => write!(f, "resource exhausted"),
        }
    }
}

/// One finished attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    /// Wall time the attempt used; charged to the step's jobsets.
    pub duration: Duration,
}

impl AttemptReport {
    pub fn new(outcome: AttemptOutcome, started_at: DateTime<Utc>, duration: Duration) -> Self {
        Self { outcome, started_at, duration }
    }
}

/// What became of a step after an attempt was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Succeeded; no longer tracked.
    Finished,
    /// Logical failure; tracked but not queued. The caller requeues or removes it.
    Released,
    /// Climbed a rung and is queued again with this grant.
    Retry(ResourceGrant),
}

/// A step handed to the dispatch loop.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub step: Arc<Step>,
    /// Snapshot the step was ordered by when popped.
    pub info: StepInfo,
    pub grant: ResourceGrant,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Inspection view of a tracked step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    pub step_id: StepId,
    pub runnable: bool,
    pub dispatched: bool,
    pub tries: u32,
    pub rung: Rung,
    pub runnable_since: Option<DateTime<Utc>>,
    pub lowest_share_used: Option<f64>,
    pub highest_global_priority: Option<i32>,
    pub highest_local_priority: Option<i32>,
    pub lowest_build_id: Option<BuildId>,
}
