//! Supervisor Loop (spec.md 4.G, `join`) and the process-wide state spec.md
//! 3. DATA MODEL describes: the single long-lived instance that owns the
//! DesiredCensus, Registry, signal intake, and resource monitor, and drives
//! the state machine between them.

use dusa_collection_utils::core::errors::ErrorArrayItem;
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;

use crate::census;
use crate::config::{self, DesiredCensus};
use crate::queue_group::QueueGroup;
use crate::reaper::{self, ReapInterrupted};
use crate::registry::Registry;
use crate::resource_monitor::{MonitorAction, ResourceMonitor};
use crate::signals::{self, SelfPipe, SignalEvent};
use crate::worker::{self, WorkerConfig, WorkerEntryPoint};

const SLEEP_TICK: Duration = Duration::from_secs(1);

/// Builds a fresh [`WorkerEntryPoint`] for a newly spawned child in a given
/// queue-group. Supplied by the embedding application.
pub type EntryPointFactory = Box<dyn Fn(&QueueGroup) -> Box<dyn WorkerEntryPoint>>;

pub struct Supervisor {
    desired: DesiredCensus,
    registry: Registry,
    resource_monitor: ResourceMonitor,
    self_pipe: SelfPipe,
    master_pid: Pid,
    worker_config: WorkerConfig,
    make_entry_point: EntryPointFactory,
}

impl Supervisor {
    /// Builds the supervisor in the `(initialized)` state (spec.md 3. DATA
    /// MODEL "Lifecycle"). Config parse failure here is propagated straight
    /// to the caller; the master never enters the loop (spec.md 7. ERROR
    /// HANDLING DESIGN).
    pub fn new(pool_name: impl Into<String>, make_entry_point: EntryPointFactory) -> Result<Self, ErrorArrayItem> {
        set_proctitle("(initialized)");
        let master_pid = Pid::this();
        let desired = config::load()?;
        let worker_config = WorkerConfig::new(pool_name, master_pid).with_interval(worker::interval_from_env());

        Ok(Self {
            desired,
            registry: Registry::new(),
            resource_monitor: ResourceMonitor::new(),
            self_pipe: SelfPipe::new()?,
            master_pid,
            worker_config,
            make_entry_point,
        })
    }

    pub fn with_job_registry_path(mut self, path: PathBuf) -> Self {
        self.resource_monitor = ResourceMonitor::new().with_job_registry_path(path);
        self
    }

    /// Transitions `(initialized)` -> `(starting)` -> `(started)`, installs
    /// signal handlers, and performs the initial reconciliation (spec.md
    /// 8. end-to-end scenario 1, "Startup").
    pub fn start(&mut self) -> Result<(), ErrorArrayItem> {
        set_proctitle("(starting)");
        self.self_pipe.install_handlers()?;
        set_proctitle("(started)");
        self.reconcile();
        Ok(())
    }

    /// The main loop (spec.md 4.G). Blocks until QUIT/INT/TERM, then
    /// transitions to `(shutting down)` and returns.
    pub fn join(&mut self) {
        loop {
            reaper::reap_opportunistic(&mut self.registry);

            match signals::drain_one() {
                Some(event) => {
                    if self.dispatch(event) {
                        break;
                    }
                }
                None => {
                    self.self_pipe.wait_and_drain(SLEEP_TICK);
                    if self.resource_monitor.sweep_due() {
                        let actions = self.resource_monitor.run_memory_sweep(&self.registry);
                        self.apply_monitor_actions(&actions);
                    }
                    self.reconcile();
                }
            }

            self.update_proctitle_managing();
        }
        set_proctitle("(shutting down)");
    }

    /// Returns `true` when the loop should exit.
    fn dispatch(&mut self, event: SignalEvent) -> bool {
        match event {
            SignalEvent::Usr1 | SignalEvent::Usr2 | SignalEvent::Cont => {
                self.forward_to_all(event.as_signal());
                false
            }
            SignalEvent::Hup => {
                self.handle_hup();
                false
            }
            SignalEvent::Winch => {
                self.desired = DesiredCensus::new();
                self.reconcile();
                false
            }
            SignalEvent::Quit => {
                self.quit_all();
                match reaper::reap_draining(&mut self.registry) {
                    Ok(()) => true,
                    // The reap was cancelled by the INT/TERM that triggered
                    // it; that same signal is still queued and will be
                    // drained (and dispatched with its own semantics) on
                    // the loop's next iteration.
                    Err(ReapInterrupted) => false,
                }
            }
            SignalEvent::Int => {
                self.quit_all();
                true
            }
            SignalEvent::Term => {
                self.term_all();
                true
            }
        }
    }

    fn handle_hup(&mut self) {
        log!(LogLevel::Info, "HUP received: reloading config and requesting log sink reopen");
        match config::load() {
            Ok(desired) => self.desired = desired,
            Err(e) => log!(LogLevel::Error, "Config reload failed, keeping previous census: {}", e),
        }
        // Children are QUIT'd before the reconciler runs below, so their
        // replacements may transiently outnumber the old generation until
        // the old ones are reaped; replicated verbatim per spec.
        self.quit_all();
        self.reconcile();
    }

    fn reconcile(&mut self) {
        let orphan_count = self.resource_monitor.orphan_count(&self.registry, self.master_pid);
        let quit_list = census::reconcile(
            &self.desired,
            &mut self.registry,
            orphan_count,
            &self.worker_config,
            self.make_entry_point.as_ref(),
        );
        for pid in quit_list {
            send_signal(pid, Signal::SIGQUIT);
        }
    }

    fn apply_monitor_actions(&mut self, actions: &[MonitorAction]) {
        for action in actions {
            match action {
                MonitorAction::Quit(pid) => send_signal(*pid, Signal::SIGQUIT),
                MonitorAction::Term(pid) => send_signal(*pid, Signal::SIGTERM),
                MonitorAction::Kill(pid) => send_signal(*pid, Signal::SIGKILL),
            }
        }
    }

    fn forward_to_all(&self, signal: Signal) {
        for pid in self.registry.all_pids() {
            send_signal(pid, signal);
        }
    }

    fn quit_all(&self) {
        self.forward_to_all(Signal::SIGQUIT);
    }

    fn term_all(&self) {
        self.forward_to_all(Signal::SIGTERM);
    }

    fn update_proctitle_managing(&self) {
        let pids: Vec<String> = self.registry.all_pids().iter().map(|p| p.to_string()).collect();
        set_proctitle(&format!("managing [{}]", pids.join(", ")));
    }
}

impl SignalEvent {
    fn as_signal(self) -> Signal {
        match self {
            SignalEvent::Quit => Signal::SIGQUIT,
            SignalEvent::Int => Signal::SIGINT,
            SignalEvent::Term => Signal::SIGTERM,
            SignalEvent::Usr1 => Signal::SIGUSR1,
            SignalEvent::Usr2 => Signal::SIGUSR2,
            SignalEvent::Cont => Signal::SIGCONT,
            SignalEvent::Hup => Signal::SIGHUP,
            SignalEvent::Winch => Signal::SIGWINCH,
        }
    }
}

fn send_signal(pid: Pid, signal: Signal) {
    if let Err(e) = kill(pid, signal) {
        if e != nix::errno::Errno::ESRCH {
            log!(LogLevel::Warn, "Failed to send {:?} to {}: {}", signal, pid, e);
        }
    }
}

fn set_proctitle(title: &str) {
    setproctitle::set_title(title);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerHandle;

    struct NoopWorker;
    impl WorkerEntryPoint for NoopWorker {
        fn poll_once(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        fn shutdown(&self) -> bool {
            true
        }
    }

    fn test_supervisor() -> Supervisor {
        Supervisor {
            desired: DesiredCensus::new(),
            registry: Registry::new(),
            resource_monitor: ResourceMonitor::new(),
            self_pipe: SelfPipe::new().unwrap(),
            master_pid: Pid::this(),
            worker_config: WorkerConfig::new("default", Pid::this()),
            make_entry_point: Box::new(|_g| Box::new(NoopWorker)),
        }
    }

    #[test]
    fn winch_empties_desired_census_and_reconciles() {
        let mut supervisor = test_supervisor();
        supervisor.desired.insert(QueueGroup::new("high"), 3);
        let should_break = supervisor.dispatch(SignalEvent::Winch);
        assert!(!should_break);
        assert!(supervisor.desired.is_empty());
    }

    #[test]
    fn int_requests_break_and_quits_children() {
        let _guard = crate::test_support::lock_process_tests();
        let mut supervisor = test_supervisor();
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        supervisor.registry.insert(WorkerHandle {
            pid,
            group: QueueGroup::new("high"),
            verbose: false,
            vverbose: false,
        });

        let should_break = supervisor.dispatch(SignalEvent::Int);
        assert!(should_break);

        // The child should have received SIGQUIT; reap it directly.
        let _ = nix::sys::wait::waitpid(pid, None);
    }
}
