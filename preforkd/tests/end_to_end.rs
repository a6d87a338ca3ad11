// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
// Full foreground lifecycle: real forks, real reaps, real shared memory.
//
// Everything fork-related runs inside one #[test] so the process never
// forks while another test thread is mid-allocation.

use std::fs;
use std::path::{Path, PathBuf};

use preforkd::{Application, Control, RunStatus, Supervisor, SupervisorConfig};

/// Yields `total` jobs, then asks the supervisor to terminate. Each job
/// is the path of a marker file the worker creates.
struct CountedJobs {
    out_dir: PathBuf,
    total: usize,
    dispatched: usize,
}

impl Application for CountedJobs {
    type Job = PathBuf;

    fn get_next_job(&mut self, ctl: &mut Control<'_>, _slot: usize) -> anyhow::Result<Option<PathBuf>> {
        if self.dispatched < self.total {
            self.dispatched += 1;
            return Ok(Some(self.out_dir.join(format!("job-{}.done", self.dispatched))));
        }
        // Work handed out; stop once the pool drains.
        ctl.set_run_status(RunStatus::Terminate, true)?;
        Ok(None)
    }

    fn child_run(&mut self, job: PathBuf, slot: usize) -> anyhow::Result<i32> {
        fs::write(&job, format!("slot {}", slot))?;
        Ok(0)
    }
}

/// Fails on the very first job request, exercising the graceful-shutdown
/// path that also covers fork failure.
struct FailingSource;

impl Application for FailingSource {
    type Job = ();

    fn get_next_job(&mut self, _ctl: &mut Control<'_>, _slot: usize) -> anyhow::Result<Option<()>> {
        anyhow::bail!("job source went away")
    }

    fn child_run(&mut self, _job: (), _slot: usize) -> anyhow::Result<i32> {
        Ok(0)
    }
}

fn foreground_config(name: &str, pid_file: &Path, workers: usize) -> SupervisorConfig {
    SupervisorConfig::new(name)
        .pid_file(pid_file)
        .max_workers(workers)
        .detach(false)
}

#[test]
fn supervisor_runs_jobs_and_cleans_up() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Scenario 1: three jobs through a pool of two, then a clean stop.
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("e2e.pid");
    let app = CountedJobs {
        out_dir: dir.path().to_path_buf(),
        total: 3,
        dispatched: 0,
    };
    let mut supervisor = Supervisor::new(foreground_config("e2e", &pid_file, 2), app);
    supervisor.run().expect("clean shutdown");

    for n in 1..=3 {
        let marker = dir.path().join(format!("job-{}.done", n));
        assert!(marker.exists(), "worker output {} missing", marker.display());
    }
    assert!(!pid_file.exists(), "lock file must be gone after teardown");

    // Scenario 2: a failing job source terminates gracefully (exit 0
    // semantics: run() returns Ok) and still cleans up.
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("failing.pid");
    let mut supervisor = Supervisor::new(
        foreground_config("failing", &pid_file, 2),
        FailingSource,
    );
    supervisor.run().expect("hook failure drains and exits cleanly");
    assert!(!pid_file.exists());

    // Scenario 3: the same pid-file path is immediately reusable, i.e.
    // teardown really removed the lock and the IPC names.
    let app = CountedJobs {
        out_dir: dir.path().to_path_buf(),
        total: 1,
        dispatched: 0,
    };
    let mut supervisor = Supervisor::new(foreground_config("failing", &pid_file, 1), app);
    supervisor.run().expect("path reuse after teardown");
    assert!(dir.path().join("job-1.done").exists());
    assert!(!pid_file.exists());
}
