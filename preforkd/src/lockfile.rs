// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{chown, Pid, Uid};

use crate::error::SupervisorError;

/// The single-instance lock: a plain-text file holding the supervisor pid.
///
/// The file exists exactly while a supervisor considers itself the live
/// instance for its path; removing it is the last step of clean teardown.
/// Workers never touch it.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

/// What a liveness probe of the recorded pid found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Alive,
    Gone,
}

fn probe_pid(pid: i32) -> Probe {
    // Null signal: no delivery, only the permission/existence check.
    // EPERM means the process exists but belongs to someone else, which
    // counts as alive.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => Probe::Alive,
        Err(Errno::EPERM) => Probe::Alive,
        Err(_) => Probe::Gone,
    }
}

impl LockFile {
    /// Acquire the lock at `path`.
    ///
    /// An existing file naming a live pid refuses startup; a stale file is
    /// removed and replaced.
    pub fn acquire(path: &Path) -> Result<Self, SupervisorError> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let recorded = content.trim().parse::<i32>().ok();
                match recorded {
                    Some(pid) if probe_pid(pid) == Probe::Alive => {
                        return Err(SupervisorError::AlreadyRunning {
                            pid,
                            path: path.to_path_buf(),
                        });
                    }
                    Some(pid) => {
                        info!("removing stale lock file {} (pid {} is gone)", path.display(), pid);
                    }
                    None => {
                        warn!("lock file {} holds no pid, replacing it", path.display());
                    }
                }
                fs::remove_file(path).map_err(|source| SupervisorError::LockFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(SupervisorError::LockFile { path: path.to_path_buf(), source });
            }
        }

        let lock = Self { path: path.to_path_buf() };
        lock.write_pid(std::process::id() as i32)?;
        Ok(lock)
    }

    /// Record `pid` as the owner: truncate, then write a single decimal
    /// number. Called again after daemonizing, when the pid has changed.
    pub fn write_pid(&self, pid: i32) -> Result<(), SupervisorError> {
        let io = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(pid.to_string().as_bytes()));
        io.map_err(|source| SupervisorError::LockFile {
            path: self.path.clone(),
            source,
        })
    }

    /// Hand the file to the target uid before the effective-uid switch, so
    /// the switched supervisor can still remove it on teardown.
    pub fn chown_to(&self, uid: u32) -> Result<(), SupervisorError> {
        chown(&self.path, Some(Uid::from_raw(uid)), None)
            .map_err(|source| SupervisorError::SwitchUid { uid, source })
    }

    /// Delete the lock. Last step of teardown; also the bail-out path when
    /// a later startup step fails.
    pub fn remove(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("could not remove lock file {}: {}", self.path.display(), err);
            }
        }
    }
}
