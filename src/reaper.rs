//! Reaper (spec.md 4.D): opportunistic and draining collection of
//! terminated children, with registry cleanup and status logging.

use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::registry::Registry;

/// Raised when a blocking drain-reap is cancelled by an INT/TERM arriving
/// mid-wait (spec.md 4.A / 4.D). Not an error: the loop catches this at its
/// boundary and escalates per the signal that interrupted the drain.
#[derive(Debug)]
pub struct ReapInterrupted;

/// Reaps every already-terminated child without blocking, removing each
/// from `registry` and logging its pid, exit status and queue list. Returns
/// once `waitpid(WNOHANG)` reports no more terminated children -- "no
/// children to reap" is swallowed, per spec.md 7. ERROR HANDLING DESIGN.
pub fn reap_opportunistic(registry: &mut Registry) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => log_and_remove(registry, pid, format!("exited with status {}", code)),
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                log_and_remove(registry, pid, format!("terminated by signal {:?}", signal))
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => {
                log!(LogLevel::Warn, "waitpid failed during opportunistic reap: {}", e);
                break;
            }
        }
    }
}

/// Blocks until every child currently in `registry` has exited, removing
/// each as it is reaped. Used for QUIT's drain-reap. Cancellable: if
/// [`crate::signals::interrupt_reap_requested`] reports true between waits,
/// this returns early with [`ReapInterrupted`] so the loop can escalate
/// with INT/TERM semantics.
pub fn reap_draining(registry: &mut Registry) -> Result<(), ReapInterrupted> {
    crate::signals::begin_drain_reap();
    let result = reap_draining_inner(registry);
    crate::signals::end_drain_reap();
    result
}

fn reap_draining_inner(registry: &mut Registry) -> Result<(), ReapInterrupted> {
    while !registry.is_empty() {
        if crate::signals::interrupt_reap_requested() {
            return Err(ReapInterrupted);
        }
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) => log_and_remove(registry, pid, format!("exited with status {}", code)),
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                log_and_remove(registry, pid, format!("terminated by signal {:?}", signal))
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => {
                log!(LogLevel::Warn, "waitpid failed during drain-reap: {}", e);
                break;
            }
        }
    }
    Ok(())
}

fn log_and_remove(registry: &mut Registry, pid: Pid, status_description: String) {
    match registry.remove(pid) {
        Some(handle) => log!(
            LogLevel::Info,
            "Reaped worker {} ({}), group '{}'",
            pid,
            status_description,
            handle.group
        ),
        None => log!(LogLevel::Debug, "Reaped untracked pid {} ({})", pid, status_description),
    }
}
