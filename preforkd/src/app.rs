// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! The embedding contract between a host application and the supervisor.
//!
//! A host implements [`Application`] and hands it to
//! [`Supervisor::new`](crate::Supervisor::new). The supervisor calls
//! `load_config` at init and on HUP, `get_next_job` before each fork, and
//! `child_run` inside the freshly forked worker. Hooks receive a
//! [`Control`] facade over the running supervisor so they can retune it.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use log::warn;

use crate::config::{SupervisorConfig, SLOT_CAPACITY};
use crate::error::IpcError;
use crate::ipc::{AppVar, Ipc, RunStatus};

/// A host application embedded into the supervisor.
///
/// The job type is opaque to the core. Fork shares the parent's memory, so
/// any `Send` value produced by `get_next_job` arrives in `child_run`
/// unchanged.
pub trait Application {
    type Job: Send;

    /// Called on the supervisor at init and again on every HUP. May mutate
    /// the control surface (for example raise the worker cap). Must return
    /// promptly; the dispatcher is stalled while it runs.
    fn load_config(&mut self, _ctl: &mut Control<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Produce the next job, or `None` when there is nothing to do right
    /// now. An error triggers graceful shutdown.
    fn get_next_job(
        &mut self,
        ctl: &mut Control<'_>,
        slot: usize,
    ) -> anyhow::Result<Option<Self::Job>>;

    /// Execute one job in the worker process and return its exit code.
    /// Errors and panics are logged and become exit code -1.
    fn child_run(&mut self, job: Self::Job, slot: usize) -> anyhow::Result<i32>;
}

/// Supervisor-side control surface handed to the application hooks.
///
/// Before the IPC region exists (pre-init) the operations act on the
/// configuration only; afterwards they act on the live shared state. Var
/// writes staged pre-init are flushed into the region when it comes up.
pub struct Control<'a> {
    pub(crate) config: &'a mut SupervisorConfig,
    pub(crate) ipc: Option<&'a Ipc>,
    pub(crate) staged_vars: &'a mut HashMap<String, AppVar>,
}

impl Control<'_> {
    /// Raise or lower the worker-pool cap. Values below 1 are refused and
    /// the previous cap is retained.
    pub fn set_max_workers(&mut self, n: usize) -> Result<(), IpcError> {
        if n < 1 {
            warn!("refusing max_workers=0, keeping {}", self.config.max_workers);
            return Ok(());
        }
        let n = n.min(SLOT_CAPACITY);
        if n == self.config.max_workers {
            return Ok(());
        }
        if let Some(ipc) = self.ipc {
            ipc.mutex.lock()?;
            if n > ipc.region.slot_len() {
                ipc.region.set_slot_len(n);
            }
            // A lower cap just records the new limit; occupied over-limit
            // slots drain naturally and compaction trims the table later.
            self.config.max_workers = n;
            ipc.mutex.unlock()?;
        } else {
            self.config.max_workers = n;
        }
        Ok(())
    }

    pub fn get_max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn set_idle_sleep(&mut self, sleep: Duration) {
        self.config.idle_sleep = SupervisorConfig::clamp_sleep(sleep);
    }

    pub fn set_propagate_signals(&mut self, propagate: bool) {
        self.config.propagate_signals = propagate;
    }

    /// Read one shared variable. `lock` opts into taking the mutex for the
    /// read; single-variable reads may skip it.
    pub fn get_app_var(&self, name: &str, lock: bool) -> Result<Option<AppVar>, IpcError> {
        let Some(ipc) = self.ipc else {
            return Ok(self.staged_vars.get(name).cloned());
        };
        if lock {
            ipc.mutex.lock()?;
        }
        let result = ipc.region.load_vars().map(|mut vars| vars.remove(name));
        if lock {
            ipc.mutex.unlock()?;
        }
        result
    }

    /// Write one shared variable. The whole map is written back, per the
    /// region's whole-field update contract.
    pub fn set_app_var(&mut self, name: &str, value: AppVar, lock: bool) -> Result<(), IpcError> {
        let Some(ipc) = self.ipc else {
            self.staged_vars.insert(name.to_string(), value);
            return Ok(());
        };
        if lock {
            ipc.mutex.lock()?;
        }
        let result = ipc.region.load_vars().and_then(|mut vars| {
            vars.insert(name.to_string(), value);
            ipc.region.store_vars(&vars)
        });
        if lock {
            ipc.mutex.unlock()?;
        }
        result
    }

    pub fn get_run_status(&self, lock: bool) -> Result<RunStatus, IpcError> {
        let Some(ipc) = self.ipc else {
            return Ok(RunStatus::Run);
        };
        if lock {
            ipc.mutex.lock()?;
        }
        let status = ipc.region.run_status();
        if lock {
            ipc.mutex.unlock()?;
        }
        Ok(status)
    }

    /// Request termination (or confirm RUN pre-init). TERMINATE is
    /// absorbing; the dispatcher notices it on its next pass.
    pub fn set_run_status(&mut self, status: RunStatus, lock: bool) -> Result<(), IpcError> {
        let Some(ipc) = self.ipc else {
            if status == RunStatus::Terminate {
                warn!("set_run_status(TERMINATE) before init has nothing to stop");
            }
            return Ok(());
        };
        if lock {
            ipc.mutex.lock()?;
        }
        ipc.region.set_run_status(status);
        if lock {
            ipc.mutex.unlock()?;
        }
        Ok(())
    }

    pub fn get_running_workers(&self, lock: bool) -> Result<usize, IpcError> {
        let Some(ipc) = self.ipc else {
            return Ok(0);
        };
        if lock {
            ipc.mutex.lock()?;
        }
        let count = ipc.region.active_count();
        if lock {
            ipc.mutex.unlock()?;
        }
        Ok(count)
    }

    /// True iff another worker may be dispatched right now.
    pub fn has_free_slot(&self, lock: bool) -> Result<bool, IpcError> {
        Ok(self.get_running_workers(lock)? < self.config.max_workers)
    }

    pub fn get_pid_file(&self) -> &Path {
        &self.config.pid_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pre_init_control<'a>(
        config: &'a mut SupervisorConfig,
        staged: &'a mut HashMap<String, AppVar>,
    ) -> Control<'a> {
        Control { config, ipc: None, staged_vars: staged }
    }

    #[test]
    fn pre_init_ops_touch_config_only() {
        let mut config = SupervisorConfig::new("t");
        let mut staged = HashMap::new();
        let mut ctl = pre_init_control(&mut config, &mut staged);

        ctl.set_max_workers(5).unwrap();
        assert_eq!(ctl.get_max_workers(), 5);
        ctl.set_max_workers(0).unwrap();
        assert_eq!(ctl.get_max_workers(), 5);

        ctl.set_idle_sleep(Duration::ZERO);
        assert_eq!(config.idle_sleep, crate::config::MIN_SLEEP);
    }

    #[test]
    fn pre_init_vars_are_staged() {
        let mut config = SupervisorConfig::new("t");
        let mut staged = HashMap::new();
        let mut ctl = pre_init_control(&mut config, &mut staged);

        ctl.set_app_var("k", AppVar::Int(9), true).unwrap();
        assert_eq!(ctl.get_app_var("k", true).unwrap(), Some(AppVar::Int(9)));
        assert_eq!(ctl.get_app_var("missing", false).unwrap(), None);
        assert_eq!(ctl.get_run_status(false).unwrap(), RunStatus::Run);
        assert_eq!(ctl.get_running_workers(false).unwrap(), 0);
        assert!(ctl.has_free_slot(false).unwrap());
    }
}
