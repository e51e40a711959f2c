use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// A named group of builds sharing one fairness budget.
///
/// `share_used()` is the build time charged to the jobset within the
/// scheduling window, divided by its share count. Lower means more starved.
#[derive(Debug)]
pub struct Jobset {
    name: String,
    shares: AtomicU32,
    /// Total seconds currently charged; always the sum of `steps`.
    seconds: AtomicU64,
    /// Charged build time keyed by attempt start.
    steps: Mutex<BTreeMap<DateTime<Utc>, u64>>,
}

impl Jobset {
    pub fn new(name: impl Into<String>, shares: u32) -> Result<Self, CoreError> {
        let name = name.into();
        if shares == 0 {
            return Err(CoreError::InvalidShares { jobset: name, shares });
        }
        Ok(Self {
            name,
            shares: AtomicU32::new(shares),
            seconds: AtomicU64::new(0),
            steps: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shares(&self) -> u32 {
        self.shares.load(Ordering::Relaxed)
    }

    pub fn set_shares(&self, shares: u32) -> Result<(), CoreError> {
        if shares == 0 {
            return Err(CoreError::InvalidShares {
                jobset: self.name.clone(),
                shares,
            });
        }
        self.shares.store(shares, Ordering::Relaxed);
        Ok(())
    }

    /// Seconds of build time currently charged to this jobset.
    pub fn seconds(&self) -> u64 {
        self.seconds.load(Ordering::Relaxed)
    }

    pub fn share_used(&self) -> f64 {
        self.seconds() as f64 / self.shares() as f64
    }

    /// Charge an attempt that started at `start` and ran for `duration`.
    pub fn add_step(&self, start: DateTime<Utc>, duration: Duration) {
        let secs = duration.as_secs();
        let mut steps = self.steps.lock().unwrap_or_else(PoisonError::into_inner);
        *steps.entry(start).or_default() += secs;
        self.seconds.fetch_add(secs, Ordering::Relaxed);
    }

    /// Drop charges for attempts that started before `now - window`.
    /// Returns the number of seconds released.
    pub fn prune_steps(&self, now: DateTime<Utc>, window: Duration) -> u64 {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return 0;
        };

        let mut steps = self.steps.lock().unwrap_or_else(PoisonError::into_inner);
        let kept = steps.split_off(&cutoff);
        let released: u64 = steps.values().sum();
        *steps = kept;
        self.seconds.fetch_sub(released, Ordering::Relaxed);
        released
    }
}
