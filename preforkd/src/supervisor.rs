// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! The supervisor: lifecycle controller plus the dispatcher state machine.
//!
//! One pass of the dispatcher reaps finished workers, services the signal
//! latch, waits for a free slot, asks the application for a job, forks a
//! worker and records its slot. The global mutex is held across
//! multi-field state changes and dropped across anything that can block
//! for long (application hooks, idle sleeps, the free-slot wait).

use std::collections::HashMap;
use std::process;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, setsid, seteuid, ForkResult, Pid, Uid};

use crate::app::{Application, Control};
use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::ipc::{self, AppVar, Ipc, NamedMutex, RunStatus, ShmRegion};
use crate::lockfile::LockFile;
use crate::signal;
use crate::slots::SlotTable;
use crate::worker;

/// Pause after a successful fork before the next pass, so a worker that
/// exits immediately is already reapable when the pass begins.
const SETTLE_PAUSE: Duration = Duration::from_micros(20);

/// What the blocking free-slot wait came back with.
enum WaitOutcome {
    /// One worker left; its status still needs to be accounted.
    Reaped(WaitStatus),
    /// A signal was latched; restart the pass to service it.
    Signal,
    /// The kernel says we have no children although slots look busy.
    /// Restart the pass and let the reaper re-evaluate.
    Recheck,
}

/// The long-running parent process scheduling and reaping workers.
pub struct Supervisor<A: Application> {
    config: SupervisorConfig,
    app: A,
    lock: Option<LockFile>,
    ipc: Option<Ipc>,
    slots: SlotTable,
    staged_vars: HashMap<String, AppVar>,
    terminating: bool,
}

impl<A: Application> Supervisor<A> {
    pub fn new(config: SupervisorConfig, app: A) -> Self {
        Self {
            config,
            app,
            lock: None,
            ipc: None,
            slots: SlotTable::new(),
            staged_vars: HashMap::new(),
            terminating: false,
        }
    }

    /// The control surface, usable before and after `run()` started the
    /// lifecycle. Hooks get the same facade.
    pub fn control(&mut self) -> Control<'_> {
        Control {
            config: &mut self.config,
            ipc: self.ipc.as_ref(),
            staged_vars: &mut self.staged_vars,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run the full lifecycle: startup, dispatcher loop, teardown.
    ///
    /// With `detach` enabled this forks; the calling process prints the
    /// daemon pid and exits 0, and only the daemon returns from here.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        if let Err(err) = self.startup() {
            // Startup failures surface before detachment (or on stderr of
            // the already-detached child, where they at least reach logs).
            eprintln!("{}: {}", self.config.daemon_name, err);
            return Err(err);
        }
        info!(
            target: "daemon",
            "{} supervising up to {} workers (pid {})",
            self.config.daemon_name,
            self.config.max_workers,
            process::id()
        );

        let result = self.dispatch_loop();
        self.teardown();
        if let Err(ref err) = result {
            error!("dispatcher aborted: {}", err);
        }
        result
    }

    // ---- lifecycle ----

    fn startup(&mut self) -> Result<(), SupervisorError> {
        let lock = LockFile::acquire(&self.config.pid_file)?;
        match self.startup_after_lock(&lock) {
            Ok(()) => {
                self.lock = Some(lock);
                Ok(())
            }
            Err(err) => {
                // Anything past lock acquisition must not leave the file
                // behind, or the next start would see a live pid forever.
                if let Some(ipc) = self.ipc.take() {
                    ipc.region.unlink();
                    ipc.mutex.unlink();
                }
                lock.remove();
                Err(err)
            }
        }
    }

    fn startup_after_lock(&mut self, lock: &LockFile) -> Result<(), SupervisorError> {
        if self.config.detach {
            match unsafe { fork() }.map_err(SupervisorError::Daemonize)? {
                ForkResult::Parent { child } => {
                    // The daemon pid goes to stdout for scripts wrapping us.
                    println!("{}", child);
                    process::exit(0);
                }
                ForkResult::Child => {
                    setsid().map_err(SupervisorError::Daemonize)?;
                }
            }
        }

        lock.write_pid(process::id() as i32)?;

        if let Some(uid) = self.config.run_as_uid {
            if Uid::effective().as_raw() != uid {
                lock.chown_to(uid)?;
                seteuid(Uid::from_raw(uid))
                    .map_err(|source| SupervisorError::SwitchUid { uid, source })?;
                info!(target: "daemon", "switched effective uid to {}", uid);
            }
        }

        let region = ShmRegion::create(
            &ipc::region_name(&self.config.pid_file),
            self.config.ipc_size,
        )?;
        let mutex = NamedMutex::open(&ipc::mutex_name(&self.config.pid_file))?;
        if !self.staged_vars.is_empty() {
            mutex.lock()?;
            let staged = std::mem::take(&mut self.staged_vars);
            let result = region.store_vars(&staged);
            mutex.unlock()?;
            result?;
        }
        self.ipc = Some(Ipc { region, mutex });

        {
            let mut ctl = Control {
                config: &mut self.config,
                ipc: self.ipc.as_ref(),
                staged_vars: &mut self.staged_vars,
            };
            self.app
                .load_config(&mut ctl)
                .map_err(SupervisorError::LoadConfig)?;
        }

        // load_config may have raised max_workers; the table uses the
        // post-hook value.
        if let Some(ipc) = self.ipc.as_ref() {
            ipc.mutex.lock()?;
            self.slots.init(&ipc.region, self.config.max_workers);
            ipc.mutex.unlock()?;
        }

        signal::clear();
        signal::install(&self.config.handled_signals)?;
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(ipc) = self.ipc.take() {
            ipc.region.unlink();
            ipc.mutex.unlink();
        }
        if let Some(lock) = self.lock.take() {
            lock.remove();
        }
        info!(target: "daemon", "{} torn down", self.config.daemon_name);
    }

    // ---- dispatcher ----

    fn dispatch_loop(&mut self) -> Result<(), SupervisorError> {
        let Self {
            config,
            app,
            ipc,
            slots,
            staged_vars,
            terminating,
            ..
        } = self;
        let Some(ipc) = ipc.as_ref() else {
            return Ok(());
        };

        'outer: loop {
            ipc.mutex.lock()?;
            if let Err(err) = reap_finished(ipc, slots, config) {
                return fail_unlocked(ipc, err);
            }

            let mut reload = false;
            if let Some(received) = signal::take() {
                match received {
                    Signal::SIGTERM | Signal::SIGQUIT => {
                        info!(target: "daemon", "received {}, terminating", received);
                        *terminating = true;
                        relay_to_workers(config, slots, received);
                    }
                    Signal::SIGHUP => {
                        info!(target: "daemon", "received SIGHUP, reloading configuration");
                        relay_to_workers(config, slots, received);
                        reload = true;
                    }
                    other => {
                        debug!(target: "daemon", "received {}, relaying only", other);
                        relay_to_workers(config, slots, other);
                    }
                }
            }
            if ipc.region.run_status() == RunStatus::Terminate {
                *terminating = true;
            }

            if reload {
                ipc.mutex.unlock()?;
                let mut ctl = Control {
                    config: &mut *config,
                    ipc: Some(ipc),
                    staged_vars: &mut *staged_vars,
                };
                if let Err(err) = app.load_config(&mut ctl) {
                    error!("load_config failed on reload: {:#}", err);
                    *terminating = true;
                }
                continue 'outer;
            }

            // Hold back until a slot frees up, a signal arrives, or we
            // are asked to terminate. The mutex is dropped across the
            // blocking wait.
            while !*terminating && ipc.region.active_count() >= config.max_workers {
                ipc.mutex.unlock()?;
                match wait_exit_or_signal(config)? {
                    WaitOutcome::Signal => continue 'outer,
                    WaitOutcome::Recheck => continue 'outer,
                    WaitOutcome::Reaped(status) => {
                        ipc.mutex.lock()?;
                        if let Err(err) = finish_reaped(ipc, slots, config, status) {
                            return fail_unlocked(ipc, err);
                        }
                    }
                }
            }

            if *terminating {
                ipc.region.set_run_status(RunStatus::Terminate);
                let remaining = ipc.region.active_count();
                ipc.mutex.unlock()?;
                if remaining > 0 {
                    info!(target: "daemon", "draining {} running workers", remaining);
                }
                wait_all_workers(ipc, slots, config)?;
                return Ok(());
            }

            // A signal that slipped in since the last check gets a full
            // pass of its own before anything is forked.
            if signal::pending() {
                ipc.mutex.unlock()?;
                continue 'outer;
            }

            let slot = match slots.assign(&ipc.region, config.max_workers) {
                Ok(Some(slot)) => slot,
                Ok(None) => {
                    ipc.mutex.unlock()?;
                    continue 'outer;
                }
                Err(err) => {
                    return fail_unlocked(ipc, err.into());
                }
            };
            ipc.region.inc_active();
            ipc.mutex.unlock()?;

            let mut ctl = Control {
                config: &mut *config,
                ipc: Some(ipc),
                staged_vars: &mut *staged_vars,
            };
            let job = match app.get_next_job(&mut ctl, slot) {
                Err(err) => {
                    error!("get_next_job failed: {:#}", err);
                    *terminating = true;
                    release_slot(ipc, slots, config, slot)?;
                    continue 'outer;
                }
                Ok(None) => {
                    release_slot(ipc, slots, config, slot)?;
                    if !*terminating {
                        thread::sleep(config.idle_sleep);
                    }
                    continue 'outer;
                }
                Ok(Some(job)) => job,
            };

            match unsafe { fork() } {
                Err(err) => {
                    error!("fork failed: {}", err);
                    *terminating = true;
                    release_slot(ipc, slots, config, slot)?;
                    continue 'outer;
                }
                Ok(ForkResult::Parent { child }) => {
                    debug!(target: "daemon", "worker {} dispatched to slot {}", child, slot);
                    slots.set_pid(slot, child);
                    thread::sleep(SETTLE_PAUSE);
                    continue 'outer;
                }
                Ok(ForkResult::Child) => {
                    slots.clear_local();
                    worker::run(&mut *app, job, slot, ipc);
                }
            }
        }
    }
}

/// Report a fatal error found while holding the mutex. The unlock is
/// best-effort; the caller is about to tear everything down anyway.
fn fail_unlocked<T>(ipc: &Ipc, err: SupervisorError) -> Result<T, SupervisorError> {
    let _ = ipc.mutex.unlock();
    Err(err)
}

/// Free an assigned slot again, taking the mutex for the duration.
fn release_slot(
    ipc: &Ipc,
    slots: &mut SlotTable,
    config: &SupervisorConfig,
    slot: usize,
) -> Result<(), SupervisorError> {
    ipc.mutex.lock()?;
    if let Err(err) = slots.release(&ipc.region, slot, config.max_workers) {
        return fail_unlocked(ipc, err.into());
    }
    ipc.mutex.unlock()?;
    Ok(())
}

fn relay_to_workers(config: &SupervisorConfig, slots: &SlotTable, signal_kind: Signal) {
    if !config.propagate_signals {
        return;
    }
    for pid in slots.worker_pids() {
        signal::relay(pid, signal_kind);
    }
}

/// Drain every worker that already exited, without blocking. "No
/// children" is not an error; anything else is. Caller holds the mutex.
fn reap_finished(
    ipc: &Ipc,
    slots: &mut SlotTable,
    config: &SupervisorConfig,
) -> Result<(), SupervisorError> {
    loop {
        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Ok(()),
            Ok(status) => finish_reaped(ipc, slots, config, status)?,
            Err(Errno::ECHILD) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(SupervisorError::Reap(err)),
        }
    }
}

/// Account one reaped worker: log its fate and free its slot. A worker
/// that already cleaned up after itself only loses its pid entry here.
/// Caller holds the mutex.
fn finish_reaped(
    ipc: &Ipc,
    slots: &mut SlotTable,
    config: &SupervisorConfig,
    status: WaitStatus,
) -> Result<(), SupervisorError> {
    let pid = match status {
        WaitStatus::Exited(pid, code) => {
            info!(target: "daemon", "worker {} exited with code {}", pid, code);
            pid
        }
        WaitStatus::Signaled(pid, signal_kind, _) => {
            warn!("worker {} killed by {}", pid, signal_kind);
            pid
        }
        other => {
            debug!(target: "daemon", "ignoring wait status {:?}", other);
            return Ok(());
        }
    };
    match slots.slot_of(pid) {
        Some(slot) => slots
            .release(&ipc.region, slot, config.max_workers)
            .map_err(SupervisorError::from),
        None => {
            error!("reaped worker {} without a tracked slot", pid);
            Ok(())
        }
    }
}

/// Block until one worker exits or a signal is latched, polling every
/// `no_slot_sleep`.
fn wait_exit_or_signal(config: &SupervisorConfig) -> Result<WaitOutcome, SupervisorError> {
    loop {
        if signal::pending() {
            return Ok(WaitOutcome::Signal);
        }
        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => thread::sleep(config.no_slot_sleep),
            Ok(status) => return Ok(WaitOutcome::Reaped(status)),
            Err(Errno::ECHILD) => {
                // Slots say busy, the kernel says childless. Should not
                // happen; hand the pass back to the reaper.
                debug!(target: "daemon", "no children while waiting for a free slot");
                thread::sleep(config.no_slot_sleep);
                return Ok(WaitOutcome::Recheck);
            }
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(SupervisorError::Reap(err)),
        }
    }
}

/// Terminal drain: block until every worker is gone. Locks only around
/// the per-worker accounting.
fn wait_all_workers(
    ipc: &Ipc,
    slots: &mut SlotTable,
    config: &SupervisorConfig,
) -> Result<(), SupervisorError> {
    loop {
        match waitpid(None::<Pid>, None) {
            Ok(status) => {
                ipc.mutex.lock()?;
                if let Err(err) = finish_reaped(ipc, slots, config, status) {
                    return fail_unlocked(ipc, err);
                }
                ipc.mutex.unlock()?;
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(()),
            Err(err) => return Err(SupervisorError::Reap(err)),
        }
    }
}
