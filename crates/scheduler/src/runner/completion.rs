use std::sync::Arc;

use tracing::{info, warn};

use farm_core::StepId;

use crate::error::SchedulerError;
use crate::ladder::ResourceGrant;
use crate::types::{AttemptOutcome, AttemptReport, Verdict};

use super::core::QueueState;
use super::StepScheduler;

impl StepScheduler {
    /// Resources the step gets on its next attempt.
    pub fn resource_grant(&self, id: &StepId) -> Result<ResourceGrant, SchedulerError> {
        let state = self.lock_queue()?;
        state
            .tracked
            .get(id)
            .map(|t| t.rung.grant())
            .ok_or_else(|| SchedulerError::StepNotTracked(id.clone()))
    }

    /// The step's attempt ran out of time or memory: climb one rung.
    ///
    /// The step is left out of the runnable set; requeue it with
    /// [`make_runnable`](Self::make_runnable). If the new grant is above the
    /// configured ceiling the step is evicted and
    /// [`SchedulerError::RunTimeCeilingExceeded`] is returned instead.
    ///
    /// Only an attempt in flight can exhaust its grant; anything else is
    /// rejected with [`SchedulerError::NotDispatched`] and the rung stays.
    pub fn on_attempt_resource_exhausted(&self, id: &StepId) -> Result<ResourceGrant, SchedulerError> {
        let mut state = self.lock_queue()?;
        let tracked = state
            .tracked
            .get(id)
            .ok_or_else(|| SchedulerError::StepNotTracked(id.clone()))?;
        if !tracked.dispatched {
            return Err(SchedulerError::NotDispatched(id.clone()));
        }
        let result = self.escalate(&mut state, id);
        self.update_gauges(&state);
        result
    }

    /// Apply the outcome of a dispatched attempt.
    ///
    /// The attempt's duration is charged to every jobset of the step first.
    /// Resource exhaustion climbs a rung and requeues the step.
    pub fn report_attempt(&self, id: &StepId, report: AttemptReport) -> Result<Verdict, SchedulerError> {
        let mut guard = self.lock_queue()?;
        let state = &mut *guard;

        let tracked = state
            .tracked
            .get_mut(id)
            .ok_or_else(|| SchedulerError::StepNotTracked(id.clone()))?;
        if !tracked.dispatched {
            return Err(SchedulerError::NotDispatched(id.clone()));
        }
        let step = Arc::clone(&tracked.step);
        self.shares.charge(&step.jobsets(), report.started_at, report.duration);

        let verdict = match report.outcome {
            AttemptOutcome::Success => {
                state.tracked.remove(id);
                state.runnable.remove(id);
                self.record_outcome(report.outcome);
                info!(step = %id, secs = report.duration.as_secs(), "Step finished");
                Verdict::Finished
            }
            AttemptOutcome::LogicalFailure => {
                tracked.dispatched = false;
                let rung = tracked.rung;
                self.record_outcome(report.outcome);
                info!(step = %id, rung = rung.get(), "Step failed, rung unchanged");
                Verdict::Released
            }
            AttemptOutcome::ResourceExhausted => {
                let grant = match self.escalate(state, id) {
                    Ok(grant) => grant,
                    Err(e) => {
                        self.update_gauges(state);
                        return Err(e);
                    }
                };
                Self::enqueue(state, step)?;
                Verdict::Retry(grant)
            }
        };

        self.update_gauges(state);
        drop(guard);

        if matches!(verdict, Verdict::Retry(_)) {
            self.wakeup.notify_one();
        }
        Ok(verdict)
    }

    /// Stop tracking a step: evicts it from the runnable set and discards
    /// its rung. Returns whether anything was removed.
    pub fn remove(&self, id: &StepId) -> Result<bool, SchedulerError> {
        let mut guard = self.lock_queue()?;
        let state = &mut *guard;

        let was_tracked = state.tracked.remove(id).is_some();
        let was_runnable = state.runnable.remove(id).is_some();
        let removed = was_tracked || was_runnable;
        if removed {
            if let Ok(mut m) = self.metrics.write() {
                m.steps_removed += 1;
            }
            info!(step = %id, "Step removed");
        }

        self.update_gauges(state);
        Ok(removed)
    }

    /// Advance the rung and check it against the ceiling, under the held lock.
    fn escalate(&self, state: &mut QueueState, id: &StepId) -> Result<ResourceGrant, SchedulerError> {
        let tracked = state
            .tracked
            .get_mut(id)
            .ok_or_else(|| SchedulerError::StepNotTracked(id.clone()))?;

        let from = tracked.rung;
        let grant = tracked.rung.advance().grant();
        tracked.dispatched = false;

        if let Ok(mut m) = self.metrics.write() {
            m.record_outcome(AttemptOutcome::ResourceExhausted);
            m.rung_advances += 1;
        }

        let ceiling = self.config.max_permitted_run_time();
        if grant.exceeds(ceiling) {
            state.tracked.remove(id);
            state.runnable.remove(id);
            if let Ok(mut m) = self.metrics.write() {
                m.permanent_failures += 1;
            }
            warn!(
                step = %id,
                rung = grant.rung.get(),
                permitted_secs = grant.permitted_run_time.as_secs(),
                ceiling_secs = ceiling.as_secs(),
                "Step exceeds run time ceiling, failing permanently"
            );
            return Err(SchedulerError::RunTimeCeilingExceeded {
                step: id.clone(),
                rung: grant.rung.get(),
                permitted_secs: grant.permitted_run_time.as_secs(),
                ceiling_secs: ceiling.as_secs(),
            });
        }

        info!(
            step = %id,
            from = from.get(),
            to = grant.rung.get(),
            cores = grant.desired_cores,
            run_time_secs = grant.permitted_run_time.as_secs(),
            "Step climbed a rung"
        );
        Ok(grant)
    }

    fn record_outcome(&self, outcome: AttemptOutcome) {
        if let Ok(mut m) = self.metrics.write() {
            m.record_outcome(outcome);
        }
    }
}
