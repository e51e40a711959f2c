use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::jobset::Jobset;

/// Monotonically increasing build identifier. Lower = older.
pub type BuildId = u64;

/// A top-level build, belonging to exactly one jobset.
///
/// Both priorities may be edited while the build's steps are queued, so
/// they are stored atomically and read once per priority snapshot.
#[derive(Debug)]
pub struct Build {
    pub id: BuildId,
    jobset: Arc<Jobset>,
    global_priority: AtomicI32,
    local_priority: AtomicI32,
}

impl Build {
    pub fn new(id: BuildId, jobset: Arc<Jobset>) -> Self {
        Self::with_priorities(id, jobset, 0, 0)
    }

    pub fn with_priorities(
        id: BuildId,
        jobset: Arc<Jobset>,
        global_priority: i32,
        local_priority: i32,
    ) -> Self {
        Self {
            id,
            jobset,
            global_priority: AtomicI32::new(global_priority),
            local_priority: AtomicI32::new(local_priority),
        }
    }

    pub fn jobset(&self) -> &Arc<Jobset> {
        &self.jobset
    }

    /// Operator-assigned priority; higher is more urgent.
    pub fn global_priority(&self) -> i32 {
        self.global_priority.load(Ordering::Relaxed)
    }

    pub fn set_global_priority(&self, priority: i32) {
        self.global_priority.store(priority, Ordering::Relaxed);
    }

    /// Priority from the build's own metadata; only a tie-break.
    pub fn local_priority(&self) -> i32 {
        self.local_priority.load(Ordering::Relaxed)
    }

    pub fn set_local_priority(&self, priority: i32) {
        self.local_priority.store(priority, Ordering::Relaxed);
    }
}
