// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;

/// Lower bound for the idle and no-slot sleeps. Anything shorter turns the
/// dispatcher into a busy loop that starves the workers of CPU.
pub const MIN_SLEEP: Duration = Duration::from_micros(100);

/// Slot-occupancy bytes reserved in the shared region. The pool cap can be
/// raised at runtime but never beyond this.
pub const SLOT_CAPACITY: usize = 1024;

/// Default size of the shared-memory region in bytes.
pub const DEFAULT_IPC_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Short name of the daemon; used for the default pid-file path.
    pub daemon_name: String,
    /// Upper bound on concurrently running workers. At least 1.
    pub max_workers: usize,
    /// How long the dispatcher sleeps when the application has no job.
    pub idle_sleep: Duration,
    /// Poll interval while waiting for a worker slot to free up.
    pub no_slot_sleep: Duration,
    /// Relay received signals to the workers.
    pub propagate_signals: bool,
    /// Signals the supervisor latches and services.
    pub handled_signals: Vec<Signal>,
    /// Switch the effective uid to this after daemonizing.
    pub run_as_uid: Option<u32>,
    /// Lock-file path; also the seed for the IPC key.
    pub pid_file: PathBuf,
    /// Size of the shared region holding status, slots and app vars.
    pub ipc_size: usize,
    /// Fork away from the controlling terminal. Turn off to run in the
    /// foreground under a service manager or a test harness.
    pub detach: bool,
}

impl SupervisorConfig {
    pub fn new(daemon_name: impl Into<String>) -> Self {
        let daemon_name = daemon_name.into();
        let pid_file = PathBuf::from(format!("/var/run/{}.pid", daemon_name));
        Self {
            daemon_name,
            max_workers: 1,
            idle_sleep: Duration::from_millis(50),
            no_slot_sleep: MIN_SLEEP,
            propagate_signals: true,
            handled_signals: vec![Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGHUP],
            run_as_uid: None,
            pid_file,
            ipc_size: DEFAULT_IPC_SIZE,
            detach: true,
        }
    }

    pub fn pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = path.into();
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        if n >= 1 {
            self.max_workers = n.min(SLOT_CAPACITY);
        }
        self
    }

    pub fn run_as_uid(mut self, uid: u32) -> Self {
        self.run_as_uid = Some(uid);
        self
    }

    pub fn ipc_size(mut self, bytes: usize) -> Self {
        self.ipc_size = bytes;
        self
    }

    pub fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    /// Clamp a configured sleep to the supported minimum.
    pub(crate) fn clamp_sleep(d: Duration) -> Duration {
        if d < MIN_SLEEP {
            MIN_SLEEP
        } else {
            d
        }
    }
}
