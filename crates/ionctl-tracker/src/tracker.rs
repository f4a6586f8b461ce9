//! [`ExperimentTracker`] – in-memory store of experiment contexts.
//!
//! Contexts are addressable by id and mutated in place through
//! [`ExperimentTracker::update`], so a result arriving on the data channel
//! lands on the same record the control request created. Terminal contexts
//! older than a configurable age are evicted by
//! [`ExperimentTracker::cleanup_old`], which hands them back so the caller
//! can archive them.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use ionctl_types::{KernelError, ParamMap};
use tracing::{debug, info};

use crate::context::{ExperimentContext, ExperimentStatus};

/// Thread-safe store of [`ExperimentContext`]s.
#[derive(Debug, Default)]
pub struct ExperimentTracker {
    contexts: Mutex<HashMap<String, ExperimentContext>>,
}

impl ExperimentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ExperimentContext>> {
        // Poison is ignored; contexts stay readable after a panicking writer.
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a new context and return its id.
    pub fn create(&self, parameters: ParamMap, parent_id: Option<&str>) -> String {
        let mut ctx = ExperimentContext::new(parameters);
        if let Some(parent) = parent_id {
            ctx = ctx.with_parent(parent);
        }
        let id = ctx.id().to_string();
        debug!(exp_id = %id, parent = ?parent_id, "experiment context created");
        self.lock().insert(id.clone(), ctx);
        id
    }

    /// Snapshot of one context.
    pub fn get(&self, id: &str) -> Option<ExperimentContext> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Run `f` against the context `id` under the store lock.
    ///
    /// # Errors
    ///
    /// [`KernelError::UnknownExperiment`] if no such context exists, or
    /// whatever `f` returns.
    pub fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ExperimentContext) -> Result<T, KernelError>,
    ) -> Result<T, KernelError> {
        let mut contexts = self.lock();
        let ctx = contexts
            .get_mut(id)
            .ok_or_else(|| KernelError::UnknownExperiment(id.to_string()))?;
        f(ctx)
    }

    /// Status of context `id`, if known.
    pub fn status(&self, id: &str) -> Option<ExperimentStatus> {
        self.lock().get(id).map(ExperimentContext::status)
    }

    /// Ids of all non-terminal contexts.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .values()
            .filter(|c| !c.is_terminal())
            .map(|c| c.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Evict terminal contexts that finished more than `max_age` ago.
    ///
    /// Running and created contexts are never evicted regardless of age.
    /// Returns the evicted contexts, oldest first.
    pub fn cleanup_old(&self, max_age: Duration) -> Vec<ExperimentContext> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return Vec::new();
        };
        let mut contexts = self.lock();
        let expired: Vec<String> = contexts
            .values()
            .filter(|c| c.is_terminal())
            .filter(|c| c.completed_at().unwrap_or_else(|| c.created_at()) <= cutoff)
            .map(|c| c.id().to_string())
            .collect();
        let mut evicted: Vec<ExperimentContext> =
            expired.iter().filter_map(|id| contexts.remove(id)).collect();
        drop(contexts);
        evicted.sort_by_key(|c| c.created_at());
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "expired experiment contexts cleaned up");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get() {
        let tracker = ExperimentTracker::new();
        let id = tracker.create(ParamMap::new(), None);
        let ctx = tracker.get(&id).unwrap();
        assert_eq!(ctx.id(), id);
        assert_eq!(ctx.status(), ExperimentStatus::Created);
        assert!(tracker.contains(&id));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn parent_link_is_kept() {
        let tracker = ExperimentTracker::new();
        let parent = tracker.create(ParamMap::new(), None);
        let child = tracker.create(ParamMap::new(), Some(&parent));
        assert_eq!(tracker.get(&child).unwrap().parent_id(), Some(parent.as_str()));
    }

    #[test]
    fn update_mutates_in_place() {
        let tracker = ExperimentTracker::new();
        let id = tracker.create(ParamMap::new(), None);
        tracker.update(&id, |c| c.start()).unwrap();
        assert_eq!(tracker.status(&id), Some(ExperimentStatus::Running));
        assert_eq!(tracker.active_ids(), vec![id.clone()]);
        tracker.update(&id, |c| c.complete()).unwrap();
        assert!(tracker.active_ids().is_empty());
    }

    #[test]
    fn update_unknown_id_is_an_error() {
        let tracker = ExperimentTracker::new();
        let err = tracker.update("nope", |c| c.start()).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_EXPERIMENT");
    }

    #[test]
    fn cleanup_evicts_only_terminal_contexts() {
        let tracker = ExperimentTracker::new();
        let running = tracker.create(ParamMap::new(), None);
        tracker.update(&running, |c| c.start()).unwrap();
        let done = tracker.create(ParamMap::new(), None);
        tracker.update(&done, |c| c.abort("stop")).unwrap();

        let evicted = tracker.cleanup_old(Duration::ZERO);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id(), done);
        assert!(tracker.contains(&running));
        assert!(!tracker.contains(&done));
    }

    #[test]
    fn cleanup_keeps_recent_terminal_contexts() {
        let tracker = ExperimentTracker::new();
        let id = tracker.create(ParamMap::new(), None);
        tracker.update(&id, |c| c.complete()).unwrap();
        assert!(tracker.cleanup_old(Duration::from_secs(3600)).is_empty());
        assert!(tracker.contains(&id));
    }
}
