use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use farm_core::{Step, StepId};

use crate::error::SchedulerError;
use crate::step_info::StepInfo;
use crate::types::Dispatch;

use super::core::{QueueState, TrackedStep};
use super::StepScheduler;

impl StepScheduler {
    /// Queue a step for dispatch, snapshotting its priority inputs now.
    ///
    /// A step seen for the first time starts at rung 1. A step coming back
    /// after an attempt keeps its rung. Fails if an attempt is in flight.
    pub fn make_runnable(&self, step: Arc<Step>) -> Result<StepInfo, SchedulerError> {
        let mut state = self.lock_queue()?;
        let info = Self::enqueue(&mut state, step)?;
        self.update_gauges(&state);
        drop(state);

        self.wakeup.notify_one();
        Ok(info)
    }

    /// Re-snapshot a step after one of its inputs changed (build priority
    /// edited, dependent build added, ...). Returns `None` when the step is
    /// tracked but not queued; it picks up the change when requeued.
    pub fn notify_changed(&self, id: &StepId) -> Result<Option<StepInfo>, SchedulerError> {
        let mut state = self.lock_queue()?;
        if !state.tracked.contains_key(id) {
            return Err(SchedulerError::StepNotTracked(id.clone()));
        }

        let info = state.runnable.rekey(id);
        if let Some(info) = &info {
            debug!(
                step = %id,
                global_priority = info.highest_global_priority,
                share_used = info.lowest_share_used,
                "Step re-keyed"
            );
        }
        Ok(info)
    }

    /// Re-snapshot every queued step. Returns how many were re-keyed.
    pub fn refresh_all(&self) -> Result<usize, SchedulerError> {
        let mut state = self.lock_queue()?;
        let count = state.runnable.rekey_all();
        debug!(count, "Runnable set re-keyed");
        Ok(count)
    }

    /// Drop share charges older than the scheduling window, then re-key
    /// every queued step against the new shares.
    pub fn refresh_shares(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let released = self.shares.prune(now);
        if released > 0 {
            debug!(released_secs = released, "Pruned jobset share charges");
        }
        self.refresh_all()
    }

    /// The step that would be dispatched next, without dispatching it.
    pub fn peek_highest_priority(&self) -> Result<Option<Arc<Step>>, SchedulerError> {
        let state = self.lock_queue()?;
        Ok(state.runnable.peek().map(|(_, step)| Arc::clone(step)))
    }

    /// Take the highest-priority step for dispatch, together with the grant
    /// for its current rung. The step stays tracked, marked in flight, until
    /// its attempt is reported.
    pub fn pop_highest_priority(&self) -> Result<Option<Dispatch>, SchedulerError> {
        let mut guard = self.lock_queue()?;
        let state = &mut *guard;
        let now = Utc::now();

        while let Some((info, step)) = state.runnable.pop() {
            let Some(tracked) = state.tracked.get_mut(&info.step_id) else {
                warn!(step = %info.step_id, "Dropping untracked step from runnable set");
                continue;
            };

            tracked.dispatched = true;
            tracked.tries += 1;
            let wait = tracked
                .runnable_since
                .take()
                .and_then(|since| (now - since).to_std().ok())
                .unwrap_or_default();
            let grant = tracked.rung.grant();
            let attempt = tracked.tries;

            if let Ok(mut m) = self.metrics.write() {
                m.record_dispatch(wait);
            }
            info!(
                step = %info.step_id,
                attempt,
                rung = grant.rung.get(),
                cores = grant.desired_cores,
                run_time_secs = grant.permitted_run_time.as_secs(),
                "Step dispatched"
            );
            self.update_gauges(state);

            return Ok(Some(Dispatch { step, info, grant, attempt }));
        }

        Ok(None)
    }

    /// Wait until a step is runnable and pop it. Returns `None` once the
    /// scheduler is shut down.
    pub async fn next_dispatch(&self) -> Result<Option<Dispatch>, SchedulerError> {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutdown() {
                return Ok(None);
            }
            if let Some(dispatch) = self.pop_highest_priority()? {
                return Ok(Some(dispatch));
            }

            notified.await;
        }
    }

    /// Insert into the runnable set under the held lock.
    pub(super) fn enqueue(state: &mut QueueState, step: Arc<Step>) -> Result<StepInfo, SchedulerError> {
        let id = step.id().clone();
        let tracked = state
            .tracked
            .entry(id.clone())
            .or_insert_with(|| TrackedStep::new(Arc::clone(&step)));
        if tracked.dispatched {
            return Err(SchedulerError::AlreadyDispatched(id));
        }

        tracked.step = Arc::clone(&step);
        tracked.runnable_since.get_or_insert_with(Utc::now);
        let rung = tracked.rung;

        let info = state.runnable.insert(step);
        debug!(
            step = %id,
            rung = rung.get(),
            global_priority = info.highest_global_priority,
            share_used = info.lowest_share_used,
            "Step runnable"
        );
        Ok(info)
    }
}
