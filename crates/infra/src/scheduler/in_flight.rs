use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use finman_core::RuleId;

use crate::jobs::JobId;

/// Per-rule in-flight markers.
///
/// A marker is held by one job from creation until that job is terminal.
/// The lock only guards the map and is never held across an await.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    markers: Mutex<HashMap<RuleId, JobId>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the marker for `rule_id` on behalf of `job_id`.
    ///
    /// Succeeds if the marker is free or already held by the same job.
    pub fn acquire(&self, rule_id: RuleId, job_id: JobId) -> bool {
        let mut markers = self.lock();
        match markers.get(&rule_id) {
            Some(holder) => *holder == job_id,
            None => {
                markers.insert(rule_id, job_id);
                true
            }
        }
    }

    /// Release the marker if `job_id` holds it.
    pub fn release(&self, rule_id: RuleId, job_id: JobId) {
        let mut markers = self.lock();
        if markers.get(&rule_id) == Some(&job_id) {
            markers.remove(&rule_id);
        }
    }

    pub fn holder(&self, rule_id: RuleId) -> Option<JobId> {
        self.lock().get(&rule_id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RuleId, JobId>> {
        // The map holds plain ids, so a panic elsewhere cannot leave it inconsistent.
        self.markers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
