//! Signal handlers only mark signals as pending; whoever owns the
//! current [`SignalScope`] acts on them.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use slog_scope::debug;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Kills a worker right away, even in the middle of a request.
pub const HARD_TERMINATION_SIGNAL: Signal = Signal::SIGTERM;

/// Asks a worker to exit once it has finished the request it's working on.
pub const SOFT_TERMINATION_SIGNAL: Signal = Signal::SIGUSR1;

/// Ignored by every worker, so that a closing terminal doesn't take the
/// process tree down with it. Only a scope that arms it handles it.
pub const IGNORED_SIGNAL: Signal = Signal::SIGHUP;

static ARMED: AtomicU64 = AtomicU64::new(0);
static PENDING: AtomicU64 = AtomicU64::new(0);
static WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);
static INSTALLED: Mutex<u64> = parking_lot::const_mutex(0);

fn bit(signal: Signal) -> u64 {
    1u64 << (signal as i32 as u64)
}

fn on_signal(signum: i32) {
    let mask = 1u64 << (signum as u64);
    if ARMED.load(Ordering::SeqCst) & mask == 0 {
        if signum != IGNORED_SIGNAL as i32 {
            let _ = signal_hook::low_level::emulate_default_handler(signum);
        }
        return;
    }
    PENDING.fetch_or(mask, Ordering::SeqCst);
    let fd = WAKEUP_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let _ = nix::unistd::write(fd, &[signum as u8]);
    }
}

fn install(signal: Signal) -> io::Result<()> {
    let mut installed = INSTALLED.lock();
    if *installed & bit(signal) != 0 {
        return Ok(());
    }
    let signum = signal as i32;
    unsafe {
        signal_hook::low_level::register(signum, move || on_signal(signum))?;
    }
    *installed |= bit(signal);
    Ok(())
}

fn is_installed(signal: Signal) -> bool {
    *INSTALLED.lock() & bit(signal) != 0
}

/// Returns true if `signal` was received since the last time it was taken.
pub fn is_pending(signal: Signal) -> bool {
    PENDING.load(Ordering::SeqCst) & bit(signal) != 0
}

/// Returns true and clears the pending bit, if `signal` was received.
pub fn take_pending(signal: Signal) -> bool {
    PENDING.fetch_and(!bit(signal), Ordering::SeqCst) & bit(signal) != 0
}

/// Forgets about all signals received so far. Freshly forked processes
/// call this so they don't act on their parent's signals.
pub fn clear_pending() {
    PENDING.store(0, Ordering::SeqCst);
}

/// Disarms every scope inherited from the parent process. Forked
/// children that never unwind back into their parent's code call this
/// before closing inherited descriptors.
pub fn forget_scopes() {
    ARMED.store(0, Ordering::SeqCst);
    WAKEUP_FD.store(-1, Ordering::SeqCst);
}

/// A set of signals that are handled (instead of having their default
/// effect) for as long as the scope lives. Scopes nest: dropping one
/// re-arms whatever the enclosing scope had armed.
#[derive(Debug)]
pub struct SignalScope {
    wakeup_reader: UnixStream,
    _wakeup_writer: UnixStream,
    previous_armed: u64,
    previous_fd: RawFd,
}

impl SignalScope {
    pub fn arm(signals: &[Signal]) -> io::Result<SignalScope> {
        let (wakeup_reader, wakeup_writer) = UnixStream::pair()?;
        wakeup_reader.set_nonblocking(true)?;
        wakeup_writer.set_nonblocking(true)?;
        let mut mask = 0;
        for signal in signals {
            install(*signal)?;
            mask |= bit(*signal);
        }
        let previous_fd = WAKEUP_FD.swap(wakeup_writer.as_raw_fd(), Ordering::SeqCst);
        let previous_armed = ARMED.swap(mask, Ordering::SeqCst);
        Ok(SignalScope {
            wakeup_reader,
            _wakeup_writer: wakeup_writer,
            previous_armed,
            previous_fd,
        })
    }

    /// A descriptor that becomes readable whenever an armed signal arrives.
    pub fn wakeup_fd(&self) -> RawFd {
        self.wakeup_reader.as_raw_fd()
    }

    /// Consumes pending wakeup bytes, so the descriptor stops polling as readable.
    pub fn drain_wakeups(&self) {
        let mut buf = [0u8; 64];
        let mut reader = &self.wakeup_reader;
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }
}

impl Drop for SignalScope {
    fn drop(&mut self) {
        ARMED.store(self.previous_armed, Ordering::SeqCst);
        WAKEUP_FD.store(self.previous_fd, Ordering::SeqCst);
    }
}

/// Signal dispositions as they were before [`reset_dispositions`].
#[derive(Debug, Default)]
pub struct SavedDispositions {
    saved: Vec<(Signal, SigAction)>,
}

/// Resets every signal to its default disposition, except for
/// [`IGNORED_SIGNAL`] and SIGPIPE (writes to vanished peers should fail
/// with EPIPE rather than kill the process), which are ignored.
/// Signals managed by a [`SignalScope`] already behave like their
/// default unless armed, and are left alone.
pub fn reset_dispositions() -> SavedDispositions {
    let mut saved = vec![];
    for signal in Signal::iterator() {
        if signal == Signal::SIGKILL || signal == Signal::SIGSTOP || is_installed(signal) {
            continue;
        }
        let handler = if signal == IGNORED_SIGNAL || signal == Signal::SIGPIPE {
            SigHandler::SigIgn
        } else {
            SigHandler::SigDfl
        };
        let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
        match unsafe { sigaction(signal, &action) } {
            Ok(previous) => saved.push((signal, previous)),
            Err(e) => debug!("could not reset signal disposition"; "signal" => ?signal, "error" => %e),
        }
    }
    SavedDispositions { saved }
}

impl SavedDispositions {
    pub fn revert(self) {
        for (signal, action) in self.saved {
            let _ = unsafe { sigaction(signal, &action) };
        }
    }
}
