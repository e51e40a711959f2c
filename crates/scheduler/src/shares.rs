use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use farm_core::{CoreError, Jobset, SchedulerConfig};

/// Registry of jobsets and the build time charged to each.
///
/// Charges land on the jobsets directly, so steps see them at their next
/// snapshot. Nothing here re-sorts the runnable set.
#[derive(Debug)]
pub struct ShareTracker {
    jobsets: RwLock<BTreeMap<String, Arc<Jobset>>>,
    window: Duration,
    default_shares: u32,
}

impl ShareTracker {
    pub fn new(window: Duration, default_shares: u32) -> Self {
        Self {
            jobsets: RwLock::new(BTreeMap::new()),
            window,
            default_shares: default_shares.max(1),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.scheduling_window(), config.default_jobset_shares)
    }

    /// Look up a jobset, creating it if needed. An explicit share count
    /// also updates an existing jobset.
    pub fn register(&self, name: &str, shares: Option<u32>) -> Result<Arc<Jobset>, CoreError> {
        let mut jobsets = self.jobsets.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = jobsets.get(name) {
            if let Some(shares) = shares {
                existing.set_shares(shares)?;
            }
            return Ok(Arc::clone(existing));
        }

        let jobset = Arc::new(Jobset::new(name, shares.unwrap_or(self.default_shares))?);
        debug!(jobset = name, shares = jobset.shares(), "Jobset registered");
        jobsets.insert(name.to_string(), Arc::clone(&jobset));
        Ok(jobset)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Jobset>> {
        self.jobsets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Charge one finished attempt to every jobset of its step.
    pub fn charge(&self, jobsets: &[Arc<Jobset>], started_at: DateTime<Utc>, duration: Duration) {
        for jobset in jobsets {
            jobset.add_step(started_at, duration);
            debug!(
                jobset = jobset.name(),
                secs = duration.as_secs(),
                share_used = jobset.share_used(),
                "Charged build time"
            );
        }
    }

    /// Release charges that fell out of the scheduling window.
    pub fn prune(&self, now: DateTime<Utc>) -> u64 {
        let jobsets = self.jobsets.read().unwrap_or_else(PoisonError::into_inner);
        jobsets.values().map(|j| j.prune_steps(now, self.window)).sum()
    }

    /// Current share used per jobset name.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.jobsets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, j)| (name.clone(), j.share_used()))
            .collect()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.jobsets.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
