//! Signal Intake (spec.md 4.A). Converts asynchronous OS signals into an
//! ordered, bounded in-process event stream via a self-pipe, the way a
//! single-threaded reactor has to: the handler itself does nothing but
//! record the signal and wake the loop, because almost everything else
//! (locking, logging, I/O) is not safe to do from inside a signal handler.

use dusa_collection_utils::core::errors::{ErrorArrayItem, Errors};
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use libc::c_int;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe2, read, write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

/// The set of signals that are queued for the loop to act on (spec.md 3.
/// DATA MODEL `SignalQueue`). `SIGCHLD` deliberately is not in this list: it
/// only wakes the loop (spec.md 4.A).
const QUEUEABLE_SIGNALS: &[Signal] = &[
    Signal::SIGQUIT,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCONT,
    Signal::SIGHUP,
    Signal::SIGWINCH,
];

/// Bound on the `SignalQueue`, per spec.md 3. DATA MODEL.
const SIGNAL_QUEUE_CAPACITY: usize = 5;

/// One entry of the bounded signal queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Quit,
    Int,
    Term,
    Usr1,
    Usr2,
    Cont,
    Hup,
    Winch,
}

impl SignalEvent {
    fn from_raw(sig: c_int) -> Option<Self> {
        match Signal::try_from(sig).ok()? {
            Signal::SIGQUIT => Some(Self::Quit),
            Signal::SIGINT => Some(Self::Int),
            Signal::SIGTERM => Some(Self::Term),
            Signal::SIGUSR1 => Some(Self::Usr1),
            Signal::SIGUSR2 => Some(Self::Usr2),
            Signal::SIGCONT => Some(Self::Cont),
            Signal::SIGHUP => Some(Self::Hup),
            Signal::SIGWINCH => Some(Self::Winch),
            _ => None,
        }
    }
}

// A lock-free bounded ring buffer, sized to SIGNAL_QUEUE_CAPACITY. `0` is
// not a valid signal number, so it doubles as the "empty slot" sentinel.
// Producers are signal handlers; the sole consumer is the supervisor loop.
static QUEUE: [AtomicI32; SIGNAL_QUEUE_CAPACITY] = [
    AtomicI32::new(0),
    AtomicI32::new(0),
    AtomicI32::new(0),
    AtomicI32::new(0),
    AtomicI32::new(0),
];
static QUEUE_HEAD: AtomicUsize = AtomicUsize::new(0);
static QUEUE_TAIL: AtomicUsize = AtomicUsize::new(0);
static QUEUE_LEN: AtomicUsize = AtomicUsize::new(0);
static DROPPED_SINCE_LAST_DRAIN: AtomicUsize = AtomicUsize::new(0);

static SELF_PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Raised by the INT/TERM handlers when a QUIT-reap (the blocking
/// drain-reap) is in progress, so the drain-reap primitive can unwind and
/// let the loop escalate. This is a control-flow token, not an error.
static INTERRUPT_REAP_REQUESTED: std::sync::atomic::AtomicBool =
    std::sync::atomic::AtomicBool::new(false);
static DRAIN_REAP_IN_PROGRESS: std::sync::atomic::AtomicBool =
    std::sync::atomic::AtomicBool::new(false);

fn enqueue(sig: c_int) -> bool {
    loop {
        let len = QUEUE_LEN.load(Ordering::Acquire);
        if len >= SIGNAL_QUEUE_CAPACITY {
            return false;
        }
        if QUEUE_LEN
            .compare_exchange_weak(len, len + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let slot = QUEUE_TAIL.fetch_add(1, Ordering::AcqRel) % SIGNAL_QUEUE_CAPACITY;
            QUEUE[slot].store(sig, Ordering::Release);
            return true;
        }
    }
}

fn dequeue() -> Option<c_int> {
    loop {
        let len = QUEUE_LEN.load(Ordering::Acquire);
        if len == 0 {
            return None;
        }
        if QUEUE_LEN
            .compare_exchange_weak(len, len - 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let slot = QUEUE_HEAD.fetch_add(1, Ordering::AcqRel) % SIGNAL_QUEUE_CAPACITY;
            let sig = QUEUE[slot].swap(0, Ordering::AcqRel);
            return Some(sig);
        }
    }
}

/// Async-signal-safe: writes one byte to the self-pipe's write end,
/// tolerating `EAGAIN` (the pipe is non-blocking; a full pipe just means the
/// loop hasn't drained it yet, which is fine, it will wake regardless).
fn wake_self_pipe() {
    let fd = SELF_PIPE_WRITE_FD.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    let byte: [u8; 1] = [1];
    unsafe {
        libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
    }
}

extern "C" fn handle_queueable(sig: c_int) {
    if !enqueue(sig) {
        DROPPED_SINCE_LAST_DRAIN.fetch_add(1, Ordering::Relaxed);
    }
    if DRAIN_REAP_IN_PROGRESS.load(Ordering::Acquire)
        && matches!(Signal::try_from(sig), Ok(Signal::SIGINT) | Ok(Signal::SIGTERM))
    {
        INTERRUPT_REAP_REQUESTED.store(true, Ordering::Release);
    }
    wake_self_pipe();
}

extern "C" fn handle_wake_only(_sig: c_int) {
    wake_self_pipe();
}

/// A kernel pipe used purely to wake the loop from signal handlers. Both
/// ends are close-on-exec; the read end is drained with non-blocking reads.
pub struct SelfPipe {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

impl SelfPipe {
    pub fn new() -> Result<Self, ErrorArrayItem> {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(|e| {
            ErrorArrayItem::new(Errors::InputOutput, format!("Failed to create self-pipe: {}", e))
        })?;
        Ok(Self { read_fd, write_fd })
    }

    fn write_raw_fd(&self) -> RawFd {
        std::os::fd::AsRawFd::as_raw_fd(&self.write_fd)
    }

    /// Installs the handlers. Must be called exactly once, before any
    /// signal the loop cares about might arrive.
    pub fn install_handlers(&self) -> Result<(), ErrorArrayItem> {
        SELF_PIPE_WRITE_FD.store(self.write_raw_fd(), Ordering::Release);

        let queueable_action = SigAction::new(
            SigHandler::Handler(handle_queueable),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in QUEUEABLE_SIGNALS {
            unsafe {
                sigaction(*signal, &queueable_action).map_err(|e| {
                    ErrorArrayItem::new(
                        Errors::GeneralError,
                        format!("Failed to install handler for {:?}: {}", signal, e),
                    )
                })?;
            }
        }

        let wake_only_action = SigAction::new(
            SigHandler::Handler(handle_wake_only),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            sigaction(Signal::SIGCHLD, &wake_only_action).map_err(|e| {
                ErrorArrayItem::new(Errors::GeneralError, format!("Failed to install SIGCHLD handler: {}", e))
            })?;
        }

        Ok(())
    }

    /// Blocks for up to `timeout` waiting for the self-pipe to become
    /// readable, then drains it. This is the loop's one suspension point
    /// (spec.md 5. CONCURRENCY & RESOURCE MODEL).
    pub fn wait_and_drain(&self, timeout: Duration) {
        let fd: BorrowedFd = self.read_fd.as_fd();
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let timeout_ms: i32 = timeout.as_millis().min(i32::MAX as u128) as i32;
        let poll_timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, poll_timeout) {
            Ok(n) if n > 0 => self.drain(),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => log!(LogLevel::Warn, "poll on self-pipe failed: {}", e),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(self.read_fd.as_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }
}

/// Pops at most one signal from the bounded queue, logging (and resetting)
/// any drop count observed since the previous call. Logging happens here,
/// never inside the handler, since only the loop thread may safely log.
pub fn drain_one() -> Option<SignalEvent> {
    let dropped = DROPPED_SINCE_LAST_DRAIN.swap(0, Ordering::Relaxed);
    if dropped > 0 {
        log!(LogLevel::Warn, "Signal queue was full; dropped {} signal(s)", dropped);
    }
    loop {
        let raw = dequeue()?;
        if let Some(event) = SignalEvent::from_raw(raw) {
            return Some(event);
        }
        // A non-queueable value should never reach here; skip and keep draining.
    }
}

/// Marks that a blocking drain-reap has begun, so a subsequent INT/TERM can
/// raise the interrupt-reap condition.
pub fn begin_drain_reap() {
    INTERRUPT_REAP_REQUESTED.store(false, Ordering::Release);
    DRAIN_REAP_IN_PROGRESS.store(true, Ordering::Release);
}

pub fn end_drain_reap() {
    DRAIN_REAP_IN_PROGRESS.store(false, Ordering::Release);
}

/// Consumed by the drain-reap loop on every blocking wait iteration.
pub fn interrupt_reap_requested() -> bool {
    INTERRUPT_REAP_REQUESTED.swap(false, Ordering::AcqRel)
}
