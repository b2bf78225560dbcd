//! Reverse map from OS pid to owning agent.
//!
//! Populated only while a non-persistent session is `Active`. The supervisor
//! consults it to tell managed processes from foreign ones sharing the same
//! executable name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared, cheaply cloneable pid → agent map.
#[derive(Debug, Clone, Default)]
pub struct PidTracker {
    inner: Arc<Mutex<HashMap<u32, String>>>,
}

impl PidTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `pid` belongs to `agent_id`.
    pub fn register(&self, pid: u32, agent_id: &str) {
        self.lock().insert(pid, agent_id.to_owned());
    }

    /// Forget `pid`, returning its former owner. Idempotent.
    pub fn unregister(&self, pid: u32) -> Option<String> {
        self.lock().remove(&pid)
    }

    /// Whether `pid` is tracked.
    #[must_use]
    pub fn contains(&self, pid: u32) -> bool {
        self.lock().contains_key(&pid)
    }

    /// Copy of all `(pid, agent_id)` pairs, sorted by pid.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(u32, String)> {
        let mut pairs: Vec<(u32, String)> = self
            .lock()
            .iter()
            .map(|(pid, agent)| (*pid, agent.clone()))
            .collect();
        pairs.sort_unstable_by_key(|(pid, _)| *pid);
        pairs
    }

    /// Number of tracked pids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no pid is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, String>> {
        // Map operations cannot leave the map half-updated, so a poisoned
        // lock still guards consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
