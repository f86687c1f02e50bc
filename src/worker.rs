//! Child Bootstrap (spec.md 4.H): the code that runs inside a freshly forked
//! worker before and during its polling loop. The embedding application
//! supplies a [`WorkerEntryPoint`] (its actual job-processing logic) and,
//! optionally, a post-fork hook; this module owns everything else a forked
//! child must do before it's safe to run that logic.

use dusa_collection_utils::core::errors::{ErrorArrayItem, Errors};
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{fork, getppid, ForkResult, Pid};
use std::sync::Arc;
use std::time::Duration;

use crate::queue_group::QueueGroup;
use crate::registry::WorkerHandle;

/// Queueable signals the child must reset to default disposition before
/// running any worker logic, so it doesn't inherit the master's deferred
/// handlers (spec.md 4.H, step 1).
const RESET_SIGNALS: &[Signal] = &[
    Signal::SIGQUIT,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCONT,
    Signal::SIGHUP,
    Signal::SIGWINCH,
    Signal::SIGCHLD,
];

/// Default worker polling interval, seconds (spec.md 6. EXTERNAL
/// INTERFACES, `INTERVAL`).
pub const DEFAULT_INTERVAL_SECS: u64 = 5;

/// The embedding application's job-processing logic. Constructed before the
/// fork and moved into the child; the parent drops its copy without ever
/// calling it.
pub trait WorkerEntryPoint: Send {
    /// Runs one iteration of the worker's own job-polling logic. Errors of
    /// kind `Interrupted` are retried by the caller per spec.md 4.H step 3;
    /// any other error is logged and the loop continues (the worker binary,
    /// not this module, owns what counts as a fatal condition for itself).
    fn poll_once(&mut self) -> std::io::Result<()>;

    /// The worker's own shutdown predicate, evaluated in addition to (not
    /// instead of) the parent-death check this module adds (spec.md 4.H:
    /// "the child overrides its shutdown predicate to additionally report
    /// shutdown when its parent-process-id no longer equals the master pid
    /// captured at birth").
    fn shutdown(&self) -> bool {
        false
    }
}

/// A post-fork hook, run exactly once in the child before the polling loop
/// starts (spec.md 4.H, step 2).
pub type PostForkHook = Arc<dyn Fn() + Send + Sync>;

/// Fixed, process-wide configuration for every spawned worker.
#[derive(Clone)]
pub struct WorkerConfig {
    pub pool_name: String,
    pub interval: Duration,
    pub master_pid: Pid,
    pub post_fork_hook: Option<PostForkHook>,
}

impl WorkerConfig {
    pub fn new(pool_name: impl Into<String>, master_pid: Pid) -> Self {
        Self {
            pool_name: pool_name.into(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            master_pid,
            post_fork_hook: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_post_fork_hook(mut self, hook: PostForkHook) -> Self {
        self.post_fork_hook = Some(hook);
        self
    }
}

/// Forks a worker for `group`. On success in the parent, returns the new
/// [`WorkerHandle`] to record in the [`crate::registry::Registry`]; the
/// child never returns -- it runs `entry_point`'s polling loop until its
/// shutdown predicate fires or the master dies, then exits the process.
pub fn spawn(
    group: QueueGroup,
    verbose: bool,
    vverbose: bool,
    config: &WorkerConfig,
    entry_point: Box<dyn WorkerEntryPoint>,
) -> Result<WorkerHandle, ErrorArrayItem> {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child, .. }) => {
            drop(entry_point);
            log!(LogLevel::Info, "Forked worker {} for group '{}'", child, group);
            Ok(WorkerHandle { pid: child, group, verbose, vverbose })
        }
        Ok(ForkResult::Child) => run_child(config, entry_point),
        Err(e) => Err(ErrorArrayItem::new(Errors::GeneralError, format!("fork() failed: {}", e))),
    }
}

fn run_child(config: &WorkerConfig, mut entry_point: Box<dyn WorkerEntryPoint>) -> ! {
    reset_signal_handlers();

    if let Some(hook) = &config.post_fork_hook {
        hook();
    }

    set_process_title(&config.pool_name);

    loop {
        if entry_point.shutdown() || parent_has_changed(config.master_pid) {
            break;
        }
        match entry_point.poll_once() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => log!(LogLevel::Warn, "Worker poll failed: {}", e),
        }
        std::thread::sleep(config.interval);
    }

    std::process::exit(0);
}

fn reset_signal_handlers() {
    let default_action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in RESET_SIGNALS {
        if let Err(e) = unsafe { sigaction(*signal, &default_action) } {
            log!(LogLevel::Warn, "Failed to reset handler for {:?} in child: {}", signal, e);
        }
    }
}

fn set_process_title(pool_name: &str) {
    let name = if pool_name.is_empty() { "default" } else { pool_name };
    setproctitle::set_title(format!("worker [pool: {}]", name));
}

fn parent_has_changed(master_pid_at_birth: Pid) -> bool {
    getppid() != master_pid_at_birth
}

/// Reads the worker polling interval from `INTERVAL`, seconds, defaulting
/// to [`DEFAULT_INTERVAL_SECS`] if unset or unparseable.
pub fn interval_from_env() -> Duration {
    std::env::var("INTERVAL")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_INTERVAL_SECS))
}

/// Reads worker verbosity from `LOGGING`/`VERBOSE` and `VVERBOSE` (spec.md
/// 6. EXTERNAL INTERFACES). Any non-empty value counts as enabled.
pub fn verbosity_from_env() -> (bool, bool) {
    let set = |name: &str| std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false);
    let verbose = set("LOGGING") || set("VERBOSE");
    let vverbose = set("VVERBOSE");
    (verbose, vverbose)
}
