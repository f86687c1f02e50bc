//! Worker Registry (spec.md 4.C): bookkeeping of live children,
//! `QueueGroup -> (pid -> WorkerHandle)`. A pid lives in at most one group,
//! so `remove` can stop at the first group that contains it.

use nix::unistd::Pid;
use std::collections::HashMap;

use crate::queue_group::QueueGroup;

/// Immutable description of a forked child: its pid, its queue-group, and
/// its verbosity flags. Created at fork time, destroyed when reaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub pid: Pid,
    pub group: QueueGroup,
    pub verbose: bool,
    pub vverbose: bool,
}

/// `QueueGroup -> Vec<(pid, WorkerHandle)>`, preserving insertion order
/// within each group so census deltas can be applied to "the first N pids
/// of the group" deterministically.
#[derive(Debug, Default)]
pub struct Registry {
    groups: HashMap<QueueGroup, Vec<WorkerHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly forked child. Called only after a successful fork,
    /// per spec.md 7. ERROR HANDLING DESIGN ("no partial registry state is
    /// recorded").
    pub fn insert(&mut self, handle: WorkerHandle) {
        self.groups.entry(handle.group.clone()).or_default().push(handle);
    }

    /// Removes and returns the handle for `pid`, scanning every group. Stops
    /// at the first group containing the pid, since each pid lives in
    /// exactly one group by construction.
    pub fn remove(&mut self, pid: Pid) -> Option<WorkerHandle> {
        for handles in self.groups.values_mut() {
            if let Some(index) = handles.iter().position(|h| h.pid == pid) {
                return Some(handles.remove(index));
            }
        }
        None
    }

    /// Pids currently recorded for `group`, in insertion order.
    pub fn pids_of(&self, group: &QueueGroup) -> Vec<Pid> {
        self.groups
            .get(group)
            .map(|handles| handles.iter().map(|h| h.pid).collect())
            .unwrap_or_default()
    }

    /// Every pid this registry currently tracks, across all groups.
    pub fn all_pids(&self) -> Vec<Pid> {
        self.groups.values().flatten().map(|h| h.pid).collect()
    }

    /// Number of live workers recorded for `group`.
    pub fn count_in(&self, group: &QueueGroup) -> usize {
        self.groups.get(group).map(Vec::len).unwrap_or(0)
    }

    /// Every group currently populated in the registry (independent of
    /// whatever the desired census says).
    pub fn groups(&self) -> impl Iterator<Item = &QueueGroup> {
        self.groups.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(pid: i32, group: &str) -> WorkerHandle {
        WorkerHandle {
            pid: Pid::from_raw(pid),
            group: QueueGroup::new(group),
            verbose: false,
            vverbose: false,
        }
    }

    #[test]
    fn insert_then_count_and_pids_of() {
        let mut registry = Registry::new();
        registry.insert(handle(10, "high"));
        registry.insert(handle(11, "high"));
        registry.insert(handle(20, "low"));

        assert_eq!(registry.count_in(&QueueGroup::new("high")), 2);
        assert_eq!(registry.count_in(&QueueGroup::new("low")), 1);
        assert_eq!(
            registry.pids_of(&QueueGroup::new("high")),
            vec![Pid::from_raw(10), Pid::from_raw(11)]
        );
    }

    #[test]
    fn remove_scans_until_found_and_is_idempotent() {
        let mut registry = Registry::new();
        registry.insert(handle(10, "high"));
        registry.insert(handle(20, "low"));

        let removed = registry.remove(Pid::from_raw(10));
        assert_eq!(removed.map(|h| h.pid), Some(Pid::from_raw(10)));
        assert_eq!(registry.count_in(&QueueGroup::new("high")), 0);
        assert!(registry.remove(Pid::from_raw(10)).is_none());
        assert_eq!(registry.all_pids(), vec![Pid::from_raw(20)]);
    }

    #[test]
    fn empty_registry_has_no_pids() {
        let registry = Registry::new();
        assert!(registry.is_empty());
        assert!(registry.all_pids().is_empty());
        assert_eq!(registry.count_in(&QueueGroup::new("high")), 0);
    }
}
