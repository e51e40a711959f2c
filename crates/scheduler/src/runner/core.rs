use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::info;

use farm_core::{SchedulerConfig, Step, StepId};

use crate::error::SchedulerError;
use crate::ladder::Rung;
use crate::metrics::SchedulerMetrics;
use crate::runnable::RunnableSet;
use crate::shares::ShareTracker;
use crate::types::StepStatus;

/// Retry state of one step, kept from first scheduling until it finishes.
#[derive(Debug)]
pub(super) struct TrackedStep {
    pub(super) step: Arc<Step>,
    pub(super) rung: Rung,
    pub(super) tries: u32,
    pub(super) runnable_since: Option<DateTime<Utc>>,
    /// An attempt is in flight. Such a step is never in the runnable set.
    pub(super) dispatched: bool,
}

impl TrackedStep {
    pub(super) fn new(step: Arc<Step>) -> Self {
        Self {
            step,
            rung: Rung::FIRST,
            tries: 0,
            runnable_since: None,
            dispatched: false,
        }
    }
}

/// Everything guarded by the scheduler lock.
#[derive(Debug, Default)]
pub(super) struct QueueState {
    pub(super) runnable: RunnableSet,
    pub(super) tracked: HashMap<StepId, TrackedStep>,
}

impl QueueState {
    pub(super) fn status_of(&self, id: &StepId) -> Option<StepStatus> {
        let tracked = self.tracked.get(id)?;
        let info = self.runnable.get(id);
        Some(StepStatus {
            step_id: id.clone(),
            runnable: info.is_some(),
            dispatched: tracked.dispatched,
            tries: tracked.tries,
            rung: tracked.rung,
            runnable_since: tracked.runnable_since,
            lowest_share_used: info.map(|i| i.lowest_share_used),
            highest_global_priority: info.map(|i| i.highest_global_priority),
            highest_local_priority: info.map(|i| i.highest_local_priority),
            lowest_build_id: info.map(|i| i.lowest_build_id),
        })
    }
}

/// The step scheduler. Owns the runnable set and every tracked step's rung
/// behind one lock, shared by the notification, dispatch and completion
/// paths.
#[derive(Debug)]
pub struct StepScheduler {
    pub(super) config: SchedulerConfig,
    pub(super) queue: Mutex<QueueState>,
    /// Jobset fairness accounting.
    pub(super) shares: Arc<ShareTracker>,
    /// Scheduler metrics.
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    /// Wakes dispatch loops waiting for a runnable step.
    pub(super) wakeup: Notify,
    /// Shutdown signal.
    pub(super) shutdown: AtomicBool,
}

impl StepScheduler {
    /// Create a scheduler with its own share tracker.
    pub fn new(config: SchedulerConfig) -> Self {
        let shares = Arc::new(ShareTracker::from_config(&config));
        Self::with_shares(config, shares)
    }

    /// Create a scheduler over an existing share tracker.
    pub fn with_shares(config: SchedulerConfig, shares: Arc<ShareTracker>) -> Self {
        Self {
            config,
            queue: Mutex::new(QueueState::default()),
            shares,
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            wakeup: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get a handle to the jobset share tracker.
    pub fn shares(&self) -> Arc<ShareTracker> {
        Arc::clone(&self.shares)
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// Get an Arc to the metrics (for external reads without cloning).
    pub fn metrics_handle(&self) -> Arc<RwLock<SchedulerMetrics>> {
        Arc::clone(&self.metrics)
    }

    /// Signal dispatch loops to stop waiting.
    pub fn shutdown(&self) {
        info!("Step scheduler shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
        self.wakeup.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Current status of one tracked step.
    pub fn step_status(&self, id: &StepId) -> Result<Option<StepStatus>, SchedulerError> {
        Ok(self.lock_queue()?.status_of(id))
    }

    /// Status of every runnable step, in dispatch order.
    pub fn runnable_steps(&self) -> Result<Vec<StepStatus>, SchedulerError> {
        let state = self.lock_queue()?;
        Ok(state
            .runnable
            .iter()
            .filter_map(|(info, _)| state.status_of(&info.step_id))
            .collect())
    }

    /// Number of steps with retry state (runnable, in flight, or released).
    pub fn tracked_len(&self) -> Result<usize, SchedulerError> {
        Ok(self.lock_queue()?.tracked.len())
    }

    pub fn runnable_len(&self) -> Result<usize, SchedulerError> {
        Ok(self.lock_queue()?.runnable.len())
    }

    pub(super) fn lock_queue(&self) -> Result<MutexGuard<'_, QueueState>, SchedulerError> {
        self.queue
            .lock()
            .map_err(|e| SchedulerError::LockPoisoned(format!("scheduler queue lock: {}", e)))
    }

    /// Refresh gauge metrics from the locked state.
    pub(super) fn update_gauges(&self, state: &QueueState) {
        if let Ok(mut m) = self.metrics.write() {
            let dispatched = state.tracked.values().filter(|t| t.dispatched).count();
            m.record_gauges(
                state.runnable.len(),
                dispatched,
                state.tracked.values().map(|t| t.rung.get()),
            );
        }
    }
}
