use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use farm_core::{Step, StepId};

use crate::step_info::StepInfo;

/// Runnable steps kept sorted by their priority snapshot.
///
/// Holds one snapshot per step. The snapshot is also the ordering key, so a
/// step whose inputs changed must be re-keyed (removed under its old key,
/// re-captured, re-inserted) rather than updated in place.
#[derive(Debug, Default)]
pub struct RunnableSet {
    order: BTreeMap<StepInfo, Arc<Step>>,
    /// Current key of every member.
    keys: HashMap<StepId, StepInfo>,
}

impl RunnableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot `step` and insert it, replacing any previous entry.
    pub fn insert(&mut self, step: Arc<Step>) -> StepInfo {
        self.remove(step.id());
        let info = StepInfo::capture(&step);
        self.keys.insert(step.id().clone(), info.clone());
        self.order.insert(info.clone(), step);
        info
    }

    pub fn remove(&mut self, id: &StepId) -> Option<(StepInfo, Arc<Step>)> {
        let info = self.keys.remove(id)?;
        let step = self.order.remove(&info)?;
        Some((info, step))
    }

    /// Re-capture one member's snapshot. `None` if it isn't a member.
    pub fn rekey(&mut self, id: &StepId) -> Option<StepInfo> {
        let (_, step) = self.remove(id)?;
        Some(self.insert(step))
    }

    /// Re-capture every member's snapshot and rebuild the order.
    pub fn rekey_all(&mut self) -> usize {
        let steps: Vec<Arc<Step>> = std::mem::take(&mut self.order).into_values().collect();
        self.keys.clear();
        for step in &steps {
            self.insert(Arc::clone(step));
        }
        steps.len()
    }

    pub fn peek(&self) -> Option<(&StepInfo, &Arc<Step>)> {
        self.order.first_key_value()
    }

    pub fn pop(&mut self) -> Option<(StepInfo, Arc<Step>)> {
        let (info, step) = self.order.pop_first()?;
        self.keys.remove(&info.step_id);
        Some((info, step))
    }

    pub fn get(&self, id: &StepId) -> Option<&StepInfo> {
        self.keys.get(id)
    }

    pub fn contains(&self, id: &StepId) -> bool {
        self.keys.contains_key(id)
    }

    /// Members in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = (&StepInfo, &Arc<Step>)> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
