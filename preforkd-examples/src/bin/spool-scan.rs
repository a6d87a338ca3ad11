// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
// spool-scan: demo embedder for the preforkd supervisor.
//
// Watches a spool directory; every regular file dropped there becomes one
// job, processed by a freshly forked worker (here: line/byte count, then
// removal). A `.max-workers` file in the spool retunes the pool on HUP.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};
use preforkd::{Application, AppVar, Control, Supervisor, SupervisorConfig};

#[derive(Parser, Debug)]
#[command(name = "spool-scan", about = "Process files dropped into a spool directory")]
struct Cli {
    /// Directory scanned for job files
    #[arg(long, default_value = "/var/spool/preforkd")]
    spool_dir: PathBuf,

    /// Lock-file path (default: /var/run/spool-scan.pid)
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Initial worker-pool size
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Stay in the foreground instead of daemonizing
    #[arg(short = 'f', long)]
    foreground: bool,
}

/// Suffix marking a file as claimed by a dispatched job.
const CLAIMED: &str = ".working";

struct SpoolScanner {
    dir: PathBuf,
    dispatched: i64,
}

impl SpoolScanner {
    fn next_unclaimed(&self) -> anyhow::Result<Option<PathBuf>> {
        for entry in fs::read_dir(&self.dir).context("reading spool dir")? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with('.') || name.ends_with(CLAIMED) {
                continue;
            }
            return Ok(Some(path));
        }
        Ok(None)
    }
}

impl Application for SpoolScanner {
    type Job = PathBuf;

    fn load_config(&mut self, ctl: &mut Control<'_>) -> anyhow::Result<()> {
        // Drop a number into <spool>/.max-workers and HUP the daemon to
        // resize the pool without restarting it.
        let control_file = self.dir.join(".max-workers");
        if let Ok(content) = fs::read_to_string(&control_file) {
            match content.trim().parse::<usize>() {
                Ok(n) => {
                    info!("spool control file requests {} workers", n);
                    ctl.set_max_workers(n)?;
                }
                Err(_) => warn!("ignoring malformed {}", control_file.display()),
            }
        }
        Ok(())
    }

    fn get_next_job(&mut self, ctl: &mut Control<'_>, slot: usize) -> anyhow::Result<Option<PathBuf>> {
        let Some(path) = self.next_unclaimed()? else {
            return Ok(None);
        };
        // Claim by rename so the next pass cannot hand the file out twice.
        let mut claimed = path.clone().into_os_string();
        claimed.push(CLAIMED);
        let claimed = PathBuf::from(claimed);
        fs::rename(&path, &claimed).with_context(|| format!("claiming {}", path.display()))?;

        self.dispatched += 1;
        ctl.set_app_var("dispatched", AppVar::Int(self.dispatched), true)?;
        debug!("dispatching {} to slot {}", claimed.display(), slot);
        Ok(Some(claimed))
    }

    fn child_run(&mut self, job: PathBuf, slot: usize) -> anyhow::Result<i32> {
        let content = fs::read(&job).with_context(|| format!("reading {}", job.display()))?;
        let lines = content.iter().filter(|b| **b == b'\n').count();
        info!(
            "slot {}: {} has {} bytes in {} lines",
            slot,
            job.display(),
            content.len(),
            lines
        );
        fs::remove_file(&job).with_context(|| format!("removing {}", job.display()))?;
        Ok(0)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = SupervisorConfig::new("spool-scan")
        .max_workers(cli.workers)
        .detach(!cli.foreground);
    if let Some(pid_file) = cli.pid_file {
        config = config.pid_file(pid_file);
    }

    let scanner = SpoolScanner { dir: cli.spool_dir, dispatched: 0 };
    let mut supervisor = Supervisor::new(config, scanner);
    if supervisor.run().is_err() {
        std::process::exit(1);
    }
}
