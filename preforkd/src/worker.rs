// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! The code path taken inside a freshly forked worker. Nothing here
//! returns to the dispatcher: every branch ends in an exit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process;

use log::{debug, error};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, getppid, Pid};

use crate::app::Application;
use crate::ipc::Ipc;

/// Exit code for a job that failed or panicked. Maps to 255 at the OS
/// level, like any exit(-1).
const FAILED_JOB_EXIT: i32 = -1;

/// Run one job in the worker process and exit.
///
/// The caller (the dispatcher's child branch) has already cleared the
/// inherited local pid map, so this process cannot act on supervisor
/// bookkeeping by mistake.
pub(crate) fn run<A: Application>(app: &mut A, job: A::Job, slot: usize, ipc: &Ipc) -> ! {
    debug!(target: "daemon", "worker {} started in slot {}", getpid(), slot);

    let code = match catch_unwind(AssertUnwindSafe(|| app.child_run(job, slot))) {
        Ok(Ok(code)) => code,
        Ok(Err(err)) => {
            error!("worker {} slot {}: job failed: {:#}", getpid(), slot, err);
            FAILED_JOB_EXIT
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!("worker {} slot {}: job panicked: {}", getpid(), slot, msg);
            FAILED_JOB_EXIT
        }
    };

    // Orphan check. If the supervisor died, a replacement may have
    // recreated the region under the same name; touching our slot now
    // would corrupt that unrelated instance. Die without cleanup, with a
    // kill that no handler can swallow.
    if getppid() == Pid::from_raw(1) {
        error!("worker {}: supervisor is gone, exiting without slot cleanup", getpid());
        let _ = kill(getpid(), Signal::SIGKILL);
        process::exit(70);
    }

    release_own_slot(ipc, slot);
    debug!(target: "daemon", "worker {} slot {} exiting with code {}", getpid(), slot, code);
    process::exit(code);
}

/// Mark our slot free and drop the active count, under the mutex. A mutex
/// failure here leaves the cleanup to the supervisor's reaper.
fn release_own_slot(ipc: &Ipc, slot: usize) {
    if let Err(err) = ipc.mutex.lock() {
        error!("worker {}: could not lock shared state: {}", getpid(), err);
        return;
    }
    match ipc.region.occupied(slot) {
        Ok(true) => {
            if let Err(err) = ipc.region.set_occupied(slot, false) {
                error!("worker {}: slot release failed: {}", getpid(), err);
            } else {
                ipc.region.dec_active();
            }
        }
        Ok(false) => {}
        Err(err) => error!("worker {}: slot lookup failed: {}", getpid(), err),
    }
    if let Err(err) = ipc.mutex.unlock() {
        error!("worker {}: could not unlock shared state: {}", getpid(), err);
    }
}
