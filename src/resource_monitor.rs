//! Resource Monitor (spec.md 4.F): per-child memory accounting, graceful and
//! forceful termination thresholds, TermWatchlist escalation, and orphan
//! enumeration. Gated to run at most once per 60 seconds, at the tail of a
//! loop iteration where the signal queue came up empty.

use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use nix::unistd::Pid;
use procfs::process::{all_processes, Process};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::job_registry;
use crate::registry::Registry;

/// Above this, a worker is QUIT'd gracefully (spec.md 4.F).
const GRACEFUL_MEMORY_LIMIT_MB: u64 = 250;
/// Above this, a worker is TERM'd and added to the TermWatchlist.
const FORCEFUL_MEMORY_LIMIT_MB: u64 = 500;
/// Memory sweep and orphan enumeration each run at most this often.
const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// A signal the resource monitor wants the caller to deliver, with the pid
/// to deliver it to. Kept as data rather than sent directly so the caller
/// (the supervisor loop) owns all interaction with the Registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Quit(Pid),
    Term(Pid),
    Kill(Pid),
}

/// Owns `TermWatchlist`, `OrphanState` and `MemoryCheckState` (spec.md 3.
/// DATA MODEL). One instance lives for the supervisor's lifetime.
#[derive(Debug, Default)]
pub struct ResourceMonitor {
    term_watchlist: HashSet<i32>,
    last_sweep: Option<Instant>,
    orphan_cache: HashSet<i32>,
    last_orphan_check: Option<Instant>,
    job_registry_path: Option<PathBuf>,
    hostname: Option<String>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_registry_path(mut self, path: PathBuf) -> Self {
        self.job_registry_path = Some(path);
        self
    }

    fn job_registry_path(&self) -> PathBuf {
        self.job_registry_path.clone().unwrap_or_else(job_registry::default_path)
    }

    fn hostname(&mut self) -> String {
        if self.hostname.is_none() {
            self.hostname = Some(gethostname::gethostname().to_string_lossy().into_owned());
        }
        self.hostname.clone().unwrap_or_default()
    }

    /// True once [`MONITOR_INTERVAL`] has elapsed since the last sweep (or
    /// this is the first tick). Does not itself advance the clock.
    pub fn sweep_due(&self) -> bool {
        self.last_sweep.map_or(true, |t| t.elapsed() >= MONITOR_INTERVAL)
    }

    /// Runs the escalate-kills and memory-sweep steps (spec.md 4.F, items 1
    /// through 3), returning the actions the caller should apply to the
    /// registry's live children. Callers should check [`ResourceMonitor::sweep_due`]
    /// themselves before calling this to skip the cost of walking the
    /// registry when a sweep isn't due; this still re-checks internally.
    pub fn run_memory_sweep(&mut self, registry: &Registry) -> Vec<MonitorAction> {
        if !self.sweep_due() {
            return Vec::new();
        }
        self.last_sweep = Some(Instant::now());

        let mut actions = self.escalate_term_watchlist();
        actions.extend(self.sweep_memory(registry));
        actions
    }

    fn escalate_term_watchlist(&mut self) -> Vec<MonitorAction> {
        // Anything still alive a full cycle after being TERM'd is killed
        // unconditionally; the memory sweep below re-adds a pid to the
        // watchlist if it is still over threshold next time around.
        self.term_watchlist
            .drain()
            .filter(|pid| is_pid_active(*pid))
            .map(|pid| MonitorAction::Kill(Pid::from_raw(pid)))
            .collect()
    }

    fn sweep_memory(&mut self, registry: &Registry) -> Vec<MonitorAction> {
        let mut actions = Vec::new();
        let hostname = self.hostname();
        for pid in registry.all_pids() {
            let raw_pid = pid.as_raw();
            if !is_pid_active(raw_pid) {
                continue;
            }
            let grandchild = find_first_child(raw_pid);
            let usage_mb = private_dirty_mb(raw_pid) + grandchild.map(private_dirty_mb).unwrap_or(0);

            if usage_mb > FORCEFUL_MEMORY_LIMIT_MB {
                self.log_diagnostic(&hostname, raw_pid);
                log!(
                    LogLevel::Warn,
                    "Worker {} using {} MB (> {} MB); sending TERM",
                    raw_pid,
                    usage_mb,
                    FORCEFUL_MEMORY_LIMIT_MB
                );
                self.term_watchlist.insert(raw_pid);
                actions.push(MonitorAction::Term(pid));
                if let Some(gc) = grandchild {
                    self.term_watchlist.insert(gc);
                    actions.push(MonitorAction::Term(Pid::from_raw(gc)));
                }
            } else if usage_mb > GRACEFUL_MEMORY_LIMIT_MB {
                self.log_diagnostic(&hostname, raw_pid);
                log!(
                    LogLevel::Info,
                    "Worker {} using {} MB (> {} MB); sending QUIT",
                    raw_pid,
                    usage_mb,
                    GRACEFUL_MEMORY_LIMIT_MB
                );
                actions.push(MonitorAction::Quit(pid));
            }
        }
        actions
    }

    fn log_diagnostic(&self, hostname: &str, pid: i32) {
        if let Some(entry) = job_registry::lookup(&self.job_registry_path(), hostname, pid) {
            let elapsed = job_registry::elapsed_run_time_seconds(&entry);
            log!(
                LogLevel::Info,
                "Worker {} was running '{}' for {}s",
                pid,
                entry.job_description.as_deref().unwrap_or("<unknown job>"),
                elapsed
            );
        }
    }

    /// True once an orphan re-enumeration is due: [`MONITOR_INTERVAL`] has
    /// elapsed, or the cache is empty (spec.md 4.F: "re-enumerate when the
    /// cache empties").
    fn orphan_refresh_due(&self) -> bool {
        self.orphan_cache.is_empty() || self.last_orphan_check.map_or(true, |t| t.elapsed() >= MONITOR_INTERVAL)
    }

    /// Current orphan count, refreshing the cache at most once per
    /// [`MONITOR_INTERVAL`] (plus the empty-cache exception above). Used by
    /// the Census Reconciler's orphan-offset term.
    pub fn orphan_count(&mut self, registry: &Registry, master_pid: Pid) -> usize {
        self.orphan_cache.retain(|pid| is_pid_active(*pid));
        if self.orphan_refresh_due() {
            self.last_orphan_check = Some(Instant::now());
            self.orphan_cache = enumerate_orphans(registry, master_pid.as_raw());
        }
        self.orphan_cache.len()
    }
}

fn is_pid_active(pid: i32) -> bool {
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return true;
    }
    matches!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EPERM))
}

/// Sum of `Private_Dirty` across `pid`'s memory map, in MB. Read failures
/// (permission, pid already gone, missing field) are treated as 0 MB per
/// spec.md 7. ERROR HANDLING DESIGN: "permissive; avoids misclassification
/// as bloat".
fn private_dirty_mb(pid: i32) -> u64 {
    let Ok(process) = Process::new(pid) else {
        return 0;
    };
    let Ok(smaps) = process.smaps() else {
        return 0;
    };
    let total_kb: u64 = smaps
        .iter()
        .filter_map(|(_, fields)| fields.get("Private_Dirty").copied())
        .sum();
    total_kb / 1024
}

/// The first process found whose parent is `pid` (workers fork exactly one
/// grandchild per job in steady state, so "first" is sufficient).
fn find_first_child(pid: i32) -> Option<i32> {
    let processes = all_processes().ok()?;
    for entry in processes {
        let Ok(process) = entry else { continue };
        if let Ok(stat) = process.stat() {
            if stat.ppid == pid {
                return Some(process.pid());
            }
        }
    }
    None
}

/// The supervisor never `exec`s its children (see SPEC_FULL.md's Child
/// Bootstrap decision), so every worker still carries the supervisor's own
/// `comm` -- that makes `comm` a reliable job-family membership test without
/// needing a naming convention the embedding application would otherwise
/// have to supply.
fn current_comm() -> Option<String> {
    Process::myself().ok()?.stat().ok().map(|stat| stat.comm)
}

fn enumerate_orphans(registry: &Registry, master_pid: i32) -> HashSet<i32> {
    let Some(our_comm) = current_comm() else {
        return HashSet::new();
    };
    let Ok(processes) = all_processes() else {
        return HashSet::new();
    };

    let mut family = Vec::new();
    for entry in processes {
        let Ok(process) = entry else { continue };
        let Ok(stat) = process.stat() else { continue };
        if stat.comm == our_comm {
            family.push((process.pid(), stat.ppid));
        }
    }
    let family_pids: HashSet<i32> = family.iter().map(|(pid, _)| *pid).collect();
    let registered: HashSet<i32> = registry.all_pids().into_iter().map(|p| p.as_raw()).collect();

    family
        .into_iter()
        .filter(|(pid, _)| *pid != master_pid)
        .filter(|(pid, _)| !registered.contains(pid))
        .filter(|(_, ppid)| *ppid != master_pid && !family_pids.contains(ppid))
        .map(|(pid, _)| pid)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_group::QueueGroup;
    use crate::registry::WorkerHandle;
    use std::process::{Child, Command, Stdio};

    fn spawn_sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .expect("failed to spawn sleep(1)")
    }

    #[test]
    fn sweep_is_not_due_immediately_after_running() {
        let mut monitor = ResourceMonitor::new();
        let registry = Registry::new();
        assert!(monitor.sweep_due());
        monitor.run_memory_sweep(&registry);
        assert!(!monitor.sweep_due());
    }

    #[test]
    fn escalation_kills_pids_still_alive_on_watchlist() {
        let _guard = crate::test_support::lock_process_tests();
        let mut child = spawn_sleeper();
        let pid = child.id() as i32;

        let mut monitor = ResourceMonitor::new();
        monitor.term_watchlist.insert(pid);
        let actions = monitor.escalate_term_watchlist();

        assert_eq!(actions, vec![MonitorAction::Kill(Pid::from_raw(pid))]);
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn escalation_drops_pids_no_longer_alive() {
        let _guard = crate::test_support::lock_process_tests();
        let mut child = spawn_sleeper();
        let pid = child.id() as i32;
        child.kill().unwrap();
        child.wait().unwrap();

        let mut monitor = ResourceMonitor::new();
        monitor.term_watchlist.insert(pid);
        let actions = monitor.escalate_term_watchlist();
        assert!(actions.is_empty());
    }

    #[test]
    fn orphan_count_is_zero_with_no_family_members() {
        let mut monitor = ResourceMonitor::new();
        let registry = Registry::new();
        let count = monitor.orphan_count(&registry, Pid::from_raw(std::process::id() as i32));
        // Our own test process is the only member of this binary's job
        // family and it is excluded as the master itself.
        assert_eq!(count, 0);
    }

    #[test]
    fn registered_pid_is_never_orphaned() {
        let mut registry = Registry::new();
        registry.insert(WorkerHandle {
            pid: Pid::from_raw(std::process::id() as i32),
            group: QueueGroup::new("high"),
            verbose: false,
            vverbose: false,
        });
        let orphans = enumerate_orphans(&registry, std::process::id() as i32);
        assert!(!orphans.contains(&(std::process::id() as i32)));
    }
}
