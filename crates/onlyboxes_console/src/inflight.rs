//! Per (node, capability) inflight admission control.
//!
//! Counters live in memory and reset on restart; startup recovery fails
//! every in-flight task at the same time, so nothing leaks.

use onlyboxes_protocol::http_types::InflightEntry;
use onlyboxes_protocol::{capability_key, NodeId};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InflightKey {
    node_id: String,
    capability: String,
}

impl InflightKey {
    fn new(node_id: &NodeId, capability: &str) -> Self {
        Self {
            node_id: node_id.as_str().to_string(),
            capability: capability_key(capability),
        }
    }
}

/// Counter table bounded by each capability's declared `max_inflight`.
#[derive(Debug, Default)]
pub struct InflightTracker {
    inner: Mutex<HashMap<InflightKey, u32>>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically increment iff the current count is below `max_inflight`.
    pub fn try_acquire(&self, node_id: &NodeId, capability: &str, max_inflight: u32) -> bool {
        if max_inflight == 0 {
            return false;
        }
        let mut inner = self.inner.lock().expect("inflight lock poisoned");
        let count = inner.entry(InflightKey::new(node_id, capability)).or_insert(0);
        if *count >= max_inflight {
            return false;
        }
        *count += 1;
        true
    }

    /// Decrement a slot. Callers guarantee exactly one release per
    /// acquired command (the dispatcher's pending-entry removal gates it).
    pub fn release(&self, node_id: &NodeId, capability: &str) {
        let mut inner = self.inner.lock().expect("inflight lock poisoned");
        let key = InflightKey::new(node_id, capability);
        if let Some(count) = inner.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.remove(&key);
            }
        }
    }

    pub fn count(&self, node_id: &NodeId, capability: &str) -> u32 {
        let inner = self.inner.lock().expect("inflight lock poisoned");
        inner
            .get(&InflightKey::new(node_id, capability))
            .copied()
            .unwrap_or(0)
    }

    /// Non-zero entries for the dashboard inflight view.
    pub fn snapshot(&self) -> Vec<InflightEntry> {
        let inner = self.inner.lock().expect("inflight lock poisoned");
        let mut entries: Vec<InflightEntry> = inner
            .iter()
            .filter(|(_, count)| **count > 0)
            .filter_map(|(key, count)| {
                let node_id = NodeId::parse(&key.node_id).ok()?;
                Some(InflightEntry {
                    node_id,
                    capability: key.capability.clone(),
                    inflight: *count,
                    max_inflight: 0,
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.node_id.as_str(), a.capability.as_str())
                .cmp(&(b.node_id.as_str(), b.capability.as_str()))
        });
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_up_to_cap() {
        let tracker = InflightTracker::new();
        let node = NodeId::new();
        assert!(tracker.try_acquire(&node, "echo", 2));
        assert!(tracker.try_acquire(&node, "echo", 2));
        assert!(!tracker.try_acquire(&node, "echo", 2));
        assert_eq!(tracker.count(&node, "echo"), 2);
    }

    #[test]
    fn test_release_frees_a_slot() {
        let tracker = InflightTracker::new();
        let node = NodeId::new();
        assert!(tracker.try_acquire(&node, "echo", 1));
        assert!(!tracker.try_acquire(&node, "echo", 1));
        tracker.release(&node, "echo");
        assert!(tracker.try_acquire(&node, "echo", 1));
    }

    #[test]
    fn test_capability_is_case_insensitive() {
        let tracker = InflightTracker::new();
        let node = NodeId::new();
        assert!(tracker.try_acquire(&node, "pythonExec", 1));
        assert!(!tracker.try_acquire(&node, "PYTHONEXEC", 1));
        tracker.release(&node, "PythonExec");
        assert_eq!(tracker.count(&node, "pythonexec"), 0);
    }

    #[test]
    fn test_zero_cap_never_admits() {
        let tracker = InflightTracker::new();
        let node = NodeId::new();
        assert!(!tracker.try_acquire(&node, "echo", 0));
    }

    #[test]
    fn test_release_without_acquire_is_harmless() {
        let tracker = InflightTracker::new();
        let node = NodeId::new();
        tracker.release(&node, "echo");
        assert_eq!(tracker.count(&node, "echo"), 0);
        assert!(tracker.try_acquire(&node, "echo", 1));
    }

    #[test]
    fn test_nodes_are_isolated() {
        let tracker = InflightTracker::new();
        let a = NodeId::new();
        let b = NodeId::new();
        assert!(tracker.try_acquire(&a, "echo", 1));
        assert!(tracker.try_acquire(&b, "echo", 1));
        assert_eq!(tracker.snapshot().len(), 2);
    }
}
