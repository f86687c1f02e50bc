//! Census Reconciler (spec.md 4.E, `maintain_worker_count`): computes the
//! delta between desired and actual per-group worker counts, spawning or
//! requesting QUIT for the difference, with a uniform orphan-count offset
//! spread across every group in play.

use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use nix::unistd::Pid;
use std::collections::BTreeSet;

use crate::config::DesiredCensus;
use crate::queue_group::QueueGroup;
use crate::registry::Registry;
use crate::worker::{self, WorkerConfig, WorkerEntryPoint};

/// Computes `G = keys(desired) ∪ keys(registry)`, then for each group spawns
/// or returns pids to QUIT so that, absent orphans, `Registry.countIn(g)`
/// converges to `desired.get(g, 0)`. Spawning inserts directly into
/// `registry`; quitting is left to the caller, since only the caller (the
/// supervisor loop) is allowed to signal a pid.
///
/// `orphan_count` is subtracted once, spread evenly across `|G|` groups
/// (floor division; 0 if `|G|` is empty) -- spec.md 4.E's deliberately
/// coarse anti-thrash heuristic.
pub fn reconcile(
    desired: &DesiredCensus,
    registry: &mut Registry,
    orphan_count: usize,
    config: &WorkerConfig,
    make_entry_point: &dyn Fn(&QueueGroup) -> Box<dyn WorkerEntryPoint>,
) -> Vec<Pid> {
    let mut groups: BTreeSet<QueueGroup> = desired.keys().cloned().collect();
    groups.extend(registry.groups().cloned());

    let group_count = groups.len();
    let orphan_offset = if group_count == 0 { 0 } else { orphan_count / group_count };

    let mut quit_list = Vec::new();
    let (verbose, vverbose) = worker::verbosity_from_env();

    for group in groups {
        let desired_count = *desired.get(&group).unwrap_or(&0) as i64;
        let actual = registry.count_in(&group) as i64;
        let delta = desired_count - actual - orphan_offset as i64;

        if delta > 0 {
            for _ in 0..delta {
                let entry_point = make_entry_point(&group);
                match worker::spawn(group.clone(), verbose, vverbose, config, entry_point) {
                    Ok(handle) => registry.insert(handle),
                    Err(e) => {
                        log!(LogLevel::Error, "Failed to spawn worker for group '{}': {}", group, e);
                        break;
                    }
                }
            }
        } else if delta < 0 {
            let excess = (-delta) as usize;
            let pids = registry.pids_of(&group);
            let take = excess.min(pids.len());
            quit_list.extend(pids.into_iter().take(take));
        }
    }

    quit_list
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NoopWorker;
    impl WorkerEntryPoint for NoopWorker {
        fn poll_once(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        fn shutdown(&self) -> bool {
            true
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig::new("default", Pid::this()).with_interval(Duration::from_millis(5))
    }

    fn reap_all(registry: &mut Registry) {
        for pid in registry.all_pids() {
            let _ = nix::sys::wait::waitpid(pid, None);
        }
    }

    #[test]
    fn spawns_to_cover_a_positive_delta() {
        let _guard = crate::test_support::lock_process_tests();
        let mut desired = DesiredCensus::new();
        desired.insert(QueueGroup::new("high"), 2);
        let mut registry = Registry::new();
        let config = test_config();

        let quit_list = reconcile(&desired, &mut registry, 0, &config, &|_g| Box::new(NoopWorker));

        assert!(quit_list.is_empty());
        assert_eq!(registry.count_in(&QueueGroup::new("high")), 2);
        reap_all(&mut registry);
    }

    #[test]
    fn requests_quit_to_cover_a_negative_delta() {
        let _guard = crate::test_support::lock_process_tests();
        let desired = DesiredCensus::new();
        let mut registry = Registry::new();
        let config = test_config();

        // First bring two workers into being via a positive delta...
        let mut seed = DesiredCensus::new();
        seed.insert(QueueGroup::new("low"), 2);
        reconcile(&seed, &mut registry, 0, &config, &|_g| Box::new(NoopWorker));
        assert_eq!(registry.count_in(&QueueGroup::new("low")), 2);

        // ...then drop the desired count to zero.
        let quit_list = reconcile(&desired, &mut registry, 0, &config, &|_g| Box::new(NoopWorker));
        assert_eq!(quit_list.len(), 2);
        reap_all(&mut registry);
    }

    #[test]
    fn orphan_offset_suppresses_spawn_per_end_to_end_scenario_6() {
        let _guard = crate::test_support::lock_process_tests();
        // C = {"high": 4}, Registry has 3 in "high", 1 orphan, |G| = 1.
        let mut desired = DesiredCensus::new();
        desired.insert(QueueGroup::new("high"), 4);
        let mut registry = Registry::new();
        let config = test_config();

        reconcile(
            &{
                let mut seed = DesiredCensus::new();
                seed.insert(QueueGroup::new("high"), 3);
                seed
            },
            &mut registry,
            0,
            &config,
            &|_g| Box::new(NoopWorker),
        );
        assert_eq!(registry.count_in(&QueueGroup::new("high")), 3);

        let quit_list = reconcile(&desired, &mut registry, 1, &config, &|_g| Box::new(NoopWorker));
        assert!(quit_list.is_empty());
        assert_eq!(registry.count_in(&QueueGroup::new("high")), 3);
        reap_all(&mut registry);
    }

    #[test]
    fn empty_groups_is_a_no_op() {
        let desired = DesiredCensus::new();
        let mut registry = Registry::new();
        let config = test_config();
        let quit_list = reconcile(&desired, &mut registry, 5, &config, &|_g| Box::new(NoopWorker));
        assert!(quit_list.is_empty());
        assert!(registry.is_empty());
    }
}
