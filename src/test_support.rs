//! Test-only helpers shared across modules.

use std::sync::{Mutex, MutexGuard};

/// The default test harness runs `#[test]` functions concurrently on
/// multiple threads within one process. The reaper's `-1` wait (spec.md
/// 4.D: "reap whatever child of this process has exited") doesn't
/// distinguish which test spawned which child, so any test that spawns a
/// real child process -- directly or via `worker::spawn`'s `fork()` --
/// must hold this lock for as long as that child can be reaped by someone
/// else's `waitpid(-1, ...)`.
static PROCESS_TEST_LOCK: Mutex<()> = Mutex::new(());

pub fn lock_process_tests() -> MutexGuard<'static, ()> {
    PROCESS_TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
