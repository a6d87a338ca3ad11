// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::path::PathBuf;

use thiserror::Error;

/// Failures of the supervisor process itself.
///
/// Startup variants surface on stderr before the process detaches; loop
/// variants end the dispatcher and trigger teardown.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The lock file names a process that is still alive (or that we may
    /// not signal, which counts as alive).
    #[error("already running with pid {pid} (lock file {path})")]
    AlreadyRunning { pid: i32, path: PathBuf },

    #[error("lock file {path}: {source}")]
    LockFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to daemonize: {0}")]
    Daemonize(#[source] nix::Error),

    #[error("failed to switch effective uid to {uid}: {source}")]
    SwitchUid {
        uid: u32,
        #[source]
        source: nix::Error,
    },

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("failed to install handler for {signal}: {source}")]
    SignalInstall {
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::Error,
    },

    /// A reap attempt failed with something other than "no children".
    #[error("reaping workers failed: {0}")]
    Reap(#[source] nix::Error),

    #[error("load_config hook failed: {0}")]
    LoadConfig(#[source] anyhow::Error),
}

/// Failures of the shared region or its mutex.
///
/// Mutex failures are always fatal to the dispatcher: continuing with the
/// shared state unlocked would break every cross-process invariant.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("shared region of {got} bytes is too small, need at least {need}")]
    RegionTooSmall { need: usize, got: usize },

    #[error("shm {name}: {source}")]
    Shm {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("mmap of shared region failed: {0}")]
    Map(#[source] nix::Error),

    #[error("semaphore {op} failed: {source}")]
    Semaphore {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("app vars of {len} bytes exceed the region capacity of {capacity}")]
    VarsOverflow { len: usize, capacity: usize },

    #[error("app var encoding: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("slot index {index} outside the table of length {len}")]
    SlotOutOfRange { index: usize, len: usize },
}
