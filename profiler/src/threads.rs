//! Registry of kernel-launching threads
//!
//! Tracks every thread observed launching a kernel, the tid ↔ pthread
//! mapping needed for signal delivery, and the per-thread sync state used by
//! the start/stop barrier.

use crate::sys;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct RegistryState {
    tid_to_pthread: HashMap<i32, libc::pthread_t>,
    synced: HashMap<i32, bool>,
    /// Thread elected to perform the actual sampling start/stop after a
    /// barrier; the first registered launcher by default.
    selected: Option<i32>,
}

/// Registry of kernel-launching threads.
#[derive(Default)]
pub struct ThreadRegistry {
    state: Mutex<RegistryState>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a launching thread. Returns true on first observation.
    pub fn register(&self, tid: i32, pthread: libc::pthread_t) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.tid_to_pthread.contains_key(&tid) {
            return false;
        }
        debug!(tid, "thread is launching kernels");
        state.tid_to_pthread.insert(tid, pthread);
        state.synced.insert(tid, false);
        if state.selected.is_none() {
            state.selected = Some(tid);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().tid_to_pthread.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pthread handles of all registered threads (signal targets).
    pub fn handles(&self) -> Vec<libc::pthread_t> {
        self.state
            .lock()
            .unwrap()
            .tid_to_pthread
            .values()
            .copied()
            .collect()
    }

    /// True when the calling thread was elected to drive start/stop.
    pub fn is_selected(&self, tid: i32) -> bool {
        self.state.lock().unwrap().selected == Some(tid)
    }

    pub fn mark_synced(&self, tid: i32, synced: bool) {
        self.state.lock().unwrap().synced.insert(tid, synced);
    }

    pub fn all_synced(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.synced.is_empty() && state.synced.values().all(|s| *s)
    }

    /// Drop threads that no longer exist; reports reaped tids so their
    /// CPU samplers can be dropped too.
    pub fn reap_dead(&self) -> Vec<i32> {
        let mut state = self.state.lock().unwrap();
        let dead: Vec<i32> = state
            .tid_to_pthread
            .iter()
            .filter(|(_, pthread)| sys::thread_is_dead(**pthread))
            .map(|(tid, _)| *tid)
            .collect();
        for tid in &dead {
            debug!(tid, "launcher thread exited, dropping from registry");
            state.tid_to_pthread.remove(tid);
            state.synced.remove(tid);
            if state.selected == Some(*tid) {
                state.selected = state.tid_to_pthread.keys().next().copied();
            }
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_first_observation_only() {
        let registry = ThreadRegistry::new();
        assert!(registry.register(10, 1000));
        assert!(!registry.register(10, 1000));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_first_registered_is_selected() {
        let registry = ThreadRegistry::new();
        registry.register(10, 1000);
        registry.register(11, 1001);
        assert!(registry.is_selected(10));
        assert!(!registry.is_selected(11));
    }

    #[test]
    fn test_sync_tracking() {
        let registry = ThreadRegistry::new();
        registry.register(10, 1000);
        registry.register(11, 1001);
        assert!(!registry.all_synced());

        registry.mark_synced(10, true);
        assert!(!registry.all_synced());
        registry.mark_synced(11, true);
        assert!(registry.all_synced());

        registry.mark_synced(10, false);
        assert!(!registry.all_synced());
    }

    #[test]
    fn test_reap_keeps_live_threads() {
        let registry = ThreadRegistry::new();
        registry.register(sys::current_tid(), sys::current_pthread());
        assert!(registry.reap_dead().is_empty());
        assert_eq!(registry.len(), 1);
    }
}
