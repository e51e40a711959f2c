use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::AttemptOutcome;

/// Scheduler operational metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Attempts handed to the dispatch loop.
    pub steps_dispatched: u64,
    pub steps_succeeded: u64,
    pub logical_failures: u64,
    /// Attempts killed for exceeding their grant.
    pub resource_exhaustions: u64,
    pub rung_advances: u64,
    /// Steps evicted because their grant went over the ceiling.
    pub permanent_failures: u64,
    /// Explicit evictions through `remove`.
    pub steps_removed: u64,
    /// Steps currently queued.
    pub runnable_steps: usize,
    /// Steps with an attempt in flight.
    pub dispatched_steps: usize,
    /// Tracked steps per rung.
    pub steps_by_rung: BTreeMap<u32, usize>,
    /// Mean time between becoming runnable and being dispatched.
    pub avg_runnable_wait: Duration,
    pub last_dispatch: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    /// Record a dispatch that waited `wait` in the runnable set.
    pub fn record_dispatch(&mut self, wait: Duration) {
        self.steps_dispatched += 1;
        self.last_dispatch = Some(Utc::now());

        // Incremental mean: new_avg = prev_avg + (wait - prev_avg) / count
        let count = self.steps_dispatched;
        self.avg_runnable_wait = if count == 1 {
            wait
        } else {
            let prev_nanos = self.avg_runnable_wait.as_nanos() as f64;
            let cur_nanos = wait.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }

    pub fn record_outcome(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Success => self.steps_succeeded += 1,
            AttemptOutcome::LogicalFailure => self.logical_failures += 1,
            AttemptOutcome::ResourceExhausted => self.resource_exhaustions += 1,
        }
    }

    /// Overwrite the point-in-time gauges.
    pub fn record_gauges(
        &mut self,
        runnable: usize,
        dispatched: usize,
        rungs: impl IntoIterator<Item = u32>,
    ) {
        self.runnable_steps = runnable;
        self.dispatched_steps = dispatched;
        self.steps_by_rung.clear();
        for rung in rungs {
            *self.steps_by_rung.entry(rung).or_default() += 1;
        }
    }
}
