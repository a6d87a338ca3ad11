// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
// Lock-file semantics of the startup path. No forks in this binary; the
// applications here never get to dispatch anything.

use std::fs;

use preforkd::{Application, Control, SupervisorConfig, Supervisor, SupervisorError};

/// Terminates the run before any worker exists.
struct NoJobs;

impl Application for NoJobs {
    type Job = ();

    fn get_next_job(&mut self, _ctl: &mut Control<'_>, _slot: usize) -> anyhow::Result<Option<()>> {
        anyhow::bail!("stop immediately")
    }

    fn child_run(&mut self, _job: (), _slot: usize) -> anyhow::Result<i32> {
        Ok(0)
    }
}

#[test]
fn second_instance_is_refused_and_first_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("instance.pid");
    // The test process itself stands in for the live first instance.
    fs::write(&pid_file, std::process::id().to_string()).unwrap();

    let config = SupervisorConfig::new("instance")
        .pid_file(&pid_file)
        .detach(false);
    let err = Supervisor::new(config, NoJobs).run().unwrap_err();
    match err {
        SupervisorError::AlreadyRunning { pid, .. } => {
            assert_eq!(pid, std::process::id() as i32);
        }
        other => panic!("expected AlreadyRunning, got {other}"),
    }
    // The live instance's lock file is untouched.
    assert_eq!(
        fs::read_to_string(&pid_file).unwrap(),
        std::process::id().to_string()
    );
}

#[test]
fn stale_lock_file_is_replaced_and_run_proceeds() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("stale.pid");
    let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
    let dead_pid = child.id() as i32;
    child.wait().unwrap();
    fs::write(&pid_file, dead_pid.to_string()).unwrap();

    let config = SupervisorConfig::new("stale")
        .pid_file(&pid_file)
        .detach(false);
    Supervisor::new(config, NoJobs)
        .run()
        .expect("stale lock must not block startup");
    assert!(!pid_file.exists(), "teardown removes the lock file");
}

#[test]
fn unreadable_pid_dir_is_a_startup_error() {
    let config = SupervisorConfig::new("nodir")
        .pid_file("/nonexistent-preforkd-dir/nodir.pid")
        .detach(false);
    let err = Supervisor::new(config, NoJobs).run().unwrap_err();
    assert!(matches!(err, SupervisorError::LockFile { .. }));
}
