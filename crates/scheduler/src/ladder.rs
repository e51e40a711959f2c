//! Resource ladder for retried steps.
//!
//! Implements a simplified TAGS policy (Task Assignment with Unknown
//! Duration, Harchol-Balter 2002): every step starts with a small grant,
//! 30 seconds on one core. An attempt that runs out of time is killed and
//! the step climbs one rung, which buys it both more time and more cores.
//! Time and cores are derived from the same rung and never move apart.
//!
//! | rung | run time          | cores |
//! |------|-------------------|-------|
//! | 1    | 30s               | 1     |
//! | 2    | 300s (5 min)      | 4     |
//! | 3    | 3000s (50 min)    | 9     |
//! | 4    | 30000s (~8.3 h)   | 16    |
//! | 5    | 300000s (~3.5 d)  | 25    |
//!
//! The ladder has no top. Callers compare the grant against their own
//! ceiling and fail the step permanently once it is exceeded.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Position of a step on the ladder. Always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rung(u32);

impl Rung {
    pub const FIRST: Rung = Rung(1);

    /// `None` for rung 0.
    pub fn new(rung: u32) -> Option<Self> {
        (rung >= 1).then_some(Self(rung))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// 3 * 10^rung seconds, saturating.
    pub fn permitted_run_time(self) -> Duration {
        let secs = 10u64
            .checked_pow(self.0)
            .and_then(|p| p.checked_mul(3))
            .unwrap_or(u64::MAX);
        Duration::from_secs(secs)
    }

    /// rung^2 cores, saturating. Aspirational: machines cap it.
    pub fn desired_cores(self) -> u32 {
        self.0.saturating_mul(self.0)
    }

    /// Climb one rung and return the new position.
    pub fn advance(&mut self) -> Rung {
        self.0 = self.0.saturating_add(1);
        *self
    }

    pub fn grant(self) -> ResourceGrant {
        ResourceGrant {
            rung: self,
            permitted_run_time: self.permitted_run_time(),
            desired_cores: self.desired_cores(),
        }
    }
}

impl Default for Rung {
    fn default() -> Self {
        Self::FIRST
    }
}

impl fmt::Display for Rung {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resources a step is entitled to on its next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceGrant {
    pub rung: Rung,
    pub permitted_run_time: Duration,
    pub desired_cores: u32,
}

impl ResourceGrant {
    /// Cores to request on a machine offering `machine_cores`. Never 0.
    pub fn cores_on(&self, machine_cores: u32) -> u32 {
        self.desired_cores.min(machine_cores).max(1)
    }

    pub fn exceeds(&self, ceiling: Duration) -> bool {
        self.permitted_run_time > ceiling
    }
}
