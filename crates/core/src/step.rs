use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::build::{Build, BuildId};
use crate::jobset::Jobset;

/// Identity of a step, typically its derivation path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unit of dispatchable work, possibly shared by several builds.
#[derive(Debug)]
pub struct Step {
    id: StepId,
    /// Builds requiring this step, keyed by id.
    builds: RwLock<BTreeMap<BuildId, Arc<Build>>>,
}

impl Step {
    pub fn new(id: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            builds: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_builds(id: impl Into<StepId>, builds: impl IntoIterator<Item = Arc<Build>>) -> Self {
        let step = Self::new(id);
        for build in builds {
            step.add_build(build);
        }
        step
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    /// Record another build depending on this step. Returns false if it
    /// was already known.
    pub fn add_build(&self, build: Arc<Build>) -> bool {
        let mut builds = self.builds.write().unwrap_or_else(PoisonError::into_inner);
        builds.insert(build.id, build).is_none()
    }

    pub fn remove_build(&self, id: BuildId) -> Option<Arc<Build>> {
        self.builds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Point-in-time list of dependent builds, oldest first.
    pub fn builds(&self) -> Vec<Arc<Build>> {
        self.builds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Point-in-time set of jobsets reachable through the dependent
    /// builds, ordered by name. Deduplicated by instance, so two distinct
    /// jobsets sharing a name are both kept.
    pub fn jobsets(&self) -> Vec<Arc<Jobset>> {
        let builds = self.builds.read().unwrap_or_else(PoisonError::into_inner);
        let mut jobsets: BTreeMap<(&str, *const Jobset), &Arc<Jobset>> = BTreeMap::new();
        for build in builds.values() {
            let jobset = build.jobset();
            jobsets
                .entry((jobset.name(), Arc::as_ptr(jobset)))
                .or_insert(jobset);
        }
        jobsets.into_values().cloned().collect()
    }
}
