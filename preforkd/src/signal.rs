// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! Asynchronous signal intake.
//!
//! The handler writes the signal number into a single-slot latch and
//! returns; everything else happens on the dispatcher thread. Bursts
//! collapse to the most recent signal. SA_RESTART keeps the latch from
//! turning every sleep and semaphore wait into an EINTR plumbing exercise;
//! the dispatcher's waits are short polls that observe the latch anyway.

use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::error::SupervisorError;

static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Relay attempts per worker before giving up on it.
const RELAY_ATTEMPTS: u32 = 2;
const RELAY_RETRY_GAP: Duration = Duration::from_millis(1);

extern "C" fn latch_signal(signum: libc::c_int) {
    // Async-signal context: store and get out.
    LAST_SIGNAL.store(signum, Ordering::SeqCst);
}

/// Install the latch handler for every configured signal.
pub(crate) fn install(signals: &[Signal]) -> Result<(), SupervisorError> {
    let action = SigAction::new(
        SigHandler::Handler(latch_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in signals {
        // The handler only touches an atomic, which is async-signal-safe.
        unsafe { sigaction(*signal, &action) }
            .map_err(|source| SupervisorError::SignalInstall { signal: *signal, source })?;
    }
    Ok(())
}

/// True if a signal has been latched and not yet taken.
pub(crate) fn pending() -> bool {
    LAST_SIGNAL.load(Ordering::SeqCst) != 0
}

/// Take and clear the latched signal, if any.
pub(crate) fn take() -> Option<Signal> {
    let raw = LAST_SIGNAL.swap(0, Ordering::SeqCst);
    if raw == 0 {
        return None;
    }
    match Signal::try_from(raw) {
        Ok(signal) => Some(signal),
        Err(_) => {
            warn!("latched unknown signal number {}", raw);
            None
        }
    }
}

/// Drop whatever is latched without acting on it.
pub(crate) fn clear() {
    LAST_SIGNAL.store(0, Ordering::SeqCst);
}

/// Deliver `signal` to a worker, retrying once after a short gap. Failures
/// are transient by policy: give up on this worker, continue with others.
pub(crate) fn relay(pid: Pid, signal: Signal) -> bool {
    for attempt in 1..=RELAY_ATTEMPTS {
        match kill(pid, signal) {
            Ok(()) => {
                debug!(target: "daemon", "relayed {} to worker {}", signal, pid);
                return true;
            }
            Err(err) => {
                warn!("relay {} to worker {} failed (attempt {}): {}", signal, pid, attempt, err);
                if attempt < RELAY_ATTEMPTS {
                    thread::sleep(RELAY_RETRY_GAP);
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    // The latch is process-global, so these tests share it; they run in
    // one function to avoid interleaving with each other.
    #[test]
    fn latch_take_and_collapse() {
        clear();
        assert!(!pending());
        assert_eq!(take(), None);

        latch_signal(libc::SIGTERM);
        assert!(pending());
        assert_eq!(take(), Some(Signal::SIGTERM));
        assert!(!pending());
        assert_eq!(take(), None);

        // A burst keeps only the most recent signal.
        latch_signal(libc::SIGTERM);
        latch_signal(libc::SIGHUP);
        assert_eq!(take(), Some(Signal::SIGHUP));
        assert_eq!(take(), None);

        latch_signal(libc::SIGQUIT);
        clear();
        assert!(!pending());
    }

    #[test]
    fn relay_to_gone_pid_reports_failure() {
        // Spawn and fully reap a child so its pid no longer names one of
        // our processes.
        let mut child = std::process::Command::new("/bin/true")
            .spawn()
            .expect("spawn /bin/true");
        let pid = Pid::from_raw(child.id() as i32);
        child.wait().expect("wait");
        assert!(!relay(pid, Signal::SIGHUP));
    }
}
