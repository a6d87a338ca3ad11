// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # preforkd
//!
//! A prefork job supervisor: a long-running daemon that hands
//! application-defined jobs to a bounded pool of worker processes, each
//! forked fresh for one job. Meant for modest-rate, potentially
//! long-running work (ETL batches, transcodes, CPU-bound shell tasks)
//! where every job should get a clean, fully isolated process.
//!
//! ```text
//!          +--------------------------------------+
//!          |         supervisor (daemon)          |
//!          |  lock file . signal latch . slots    |
//!          +-----+----------------+---------------+
//!                | fork per job   |
//!          +-----v----+     +-----v----+
//!          | worker 0 |     | worker 1 |   ... up to max_workers
//!          +-----+----+     +-----+----+
//!                |                |
//!          +-----v----------------v---------------+
//!          |  shared region (one named mutex):    |
//!          |  run status, active count, slot      |
//!          |  occupancy, app vars                 |
//!          +--------------------------------------+
//! ```
//!
//! A host implements [`Application`] (`get_next_job` + `child_run`, and
//! optionally `load_config`), builds a [`SupervisorConfig`], and calls
//! [`Supervisor::run`]. The supervisor detaches from the terminal,
//! guards its pid file against a second instance, dispatches until it is
//! told to stop (TERM or QUIT, with HUP triggering a config reload), then
//! drains the workers and cleans up after itself.

pub mod app;
pub mod config;
pub mod error;
pub mod ipc;
pub mod lockfile;
pub mod logging;
pub mod supervisor;

mod signal;
mod slots;
mod worker;

pub use app::{Application, Control};
pub use config::SupervisorConfig;
pub use error::{IpcError, SupervisorError};
pub use ipc::{AppVar, RunStatus};
pub use logging::{FileLogger, Level};
pub use supervisor::Supervisor;
