//! Priority snapshots of runnable steps and the order they are dispatched in.
//!
//! Steps are ordered by, in decreasing precedence:
//!
//! - the highest global priority of the builds depending on the step, so an
//!   operator can bump a build to the front of the queue;
//! - the lowest used scheduling share of the jobsets depending on the step;
//! - the highest local priority of those builds (build metadata). This is
//!   only meant to order builds within one jobset, but it also breaks ties
//!   between steps of different jobsets that happen to have the same lowest
//!   share used;
//! - the lowest id of those builds, so older builds go first.
//!
//! Remaining ties are broken on the step id, which keeps distinct steps
//! distinct inside ordered containers.
//!
//! All four inputs can change while a step is queued. They are copied into a
//! [`StepInfo`] once, and comparisons only ever look at copies, which keeps
//! the comparator a total order for as long as the copies live.

use std::cmp::Ordering;

use serde::Serialize;

use farm_core::{BuildId, Step, StepId};

/// Share value of a step with no jobsets; above any real share.
pub const NO_JOBSET_SHARE: f64 = f64::INFINITY;

/// Point-in-time copy of the ordering inputs of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepInfo {
    pub step_id: StepId,
    /// Lowest share used of any jobset depending on the step.
    pub lowest_share_used: f64,
    pub highest_global_priority: i32,
    pub highest_local_priority: i32,
    pub lowest_build_id: BuildId,
}

impl StepInfo {
    /// Snapshot with no dependents; orders after every step that has some.
    pub fn empty(step_id: StepId) -> Self {
        Self {
            step_id,
            lowest_share_used: NO_JOBSET_SHARE,
            highest_global_priority: i32::MIN,
            highest_local_priority: i32::MIN,
            lowest_build_id: BuildId::MAX,
        }
    }

    /// Aggregate the current state of every build and jobset depending on
    /// `step`. Reads only; never mutates the step.
    pub fn capture(step: &Step) -> Self {
        let mut info = Self::empty(step.id().clone());

        for build in step.builds() {
            info.highest_global_priority = info.highest_global_priority.max(build.global_priority());
            info.highest_local_priority = info.highest_local_priority.max(build.local_priority());
            info.lowest_build_id = info.lowest_build_id.min(build.id);
        }

        for jobset in step.jobsets() {
            info.lowest_share_used = info.lowest_share_used.min(jobset.share_used());
        }

        info
    }
}

/// Compare the priority fields only. `Less` means `a` is dispatched first.
/// Steps that compare `Equal` here are interchangeable for scheduling.
pub fn compare_priority(a: &StepInfo, b: &StepInfo) -> Ordering {
    b.highest_global_priority
        .cmp(&a.highest_global_priority)
        .then_with(|| a.lowest_share_used.total_cmp(&b.lowest_share_used))
        .then_with(|| b.highest_local_priority.cmp(&a.highest_local_priority))
        .then_with(|| a.lowest_build_id.cmp(&b.lowest_build_id))
}

impl Ord for StepInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_priority(self, other).then_with(|| self.step_id.cmp(&other.step_id))
    }
}

impl PartialOrd for StepInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for StepInfo {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for StepInfo {}
