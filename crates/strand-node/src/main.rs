//! strand-node: controller binary for a pipelined alignment run.
//!
//! ```bash
//! # Two rounds over the fleet described in run.cfg, working in /shared/run1
//! RUST_LOG=info cargo run --bin strand-node -- run.cfg /shared/run1
//!
//! # Remote nodes managed over ssh as `align`, launcher in ~/dynamic
//! strand-node run.cfg /shared/run1 --controller-ip 10.0.0.1 --ssh-user align --launcher-dir dynamic
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use strand_control::{ControlPolicies, Controller, RunOutcome, ShellProcessManager};
use strand_types::{HostSettings, WorkDir};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "strand-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Fault-tolerant pipelined sequence alignment controller"
)]
struct Cli {
    /// Run file (GPUS, BREAK, GPU#, IP, PORT, SPLIT, SEQ, ...).
    config: PathBuf,

    /// Shared working directory visible to every node.
    workdir: PathBuf,

    /// Address of this machine; nodes with this IP are managed locally.
    #[arg(long, default_value = "127.0.0.1")]
    controller_ip: String,

    /// Login used for ssh process control (defaults to $USER).
    #[arg(long)]
    ssh_user: Option<String>,

    /// Directory holding the worker launcher on every node.
    #[arg(long, default_value = ".")]
    launcher_dir: PathBuf,

    /// Worker launcher executable.
    #[arg(long, default_value = "balancer")]
    launcher: String,

    /// Alignment kernel started by every EXEC command.
    #[arg(long, default_value = "./cudalign")]
    kernel: String,

    /// Control port of a node is base-port + device.
    #[arg(long, default_value_t = 5200)]
    base_port: u16,

    /// Aggregation socket listens on base-port + this offset.
    #[arg(long, default_value_t = 501)]
    aggregation_offset: u16,
}

impl Cli {
    fn host_settings(&self) -> HostSettings {
        let defaults = HostSettings::default();
        HostSettings {
            controller_ip: self.controller_ip.clone(),
            ssh_user: self.ssh_user.clone().unwrap_or(defaults.ssh_user),
            launcher_dir: self.launcher_dir.clone(),
            launcher: self.launcher.clone(),
            kernel: self.kernel.clone(),
            base_port: self.base_port,
            aggregation_offset: self.aggregation_offset,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=strand_control=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli  = Cli::parse();
    let host = cli.host_settings();
    let procs = ShellProcessManager::new(&host);

    let mut controller = Controller::start(
        &cli.config,
        WorkDir::new(&cli.workdir),
        host,
        procs,
        ControlPolicies::default(),
    )
    .await
    .with_context(|| format!("failed to start controller for {}", cli.config.display()))?;

    info!(
        run_id = %controller.run_id(),
        config = %cli.config.display(),
        workdir = %cli.workdir.display(),
        "controller ready"
    );

    tokio::select! {
        outcome = controller.run() => match outcome.context("run failed")? {
            RunOutcome::Completed { elapsed } => {
                info!(elapsed_ms = elapsed.as_millis() as u64, "run completed");
            }
            RunOutcome::Aborted { round } => {
                error!(round, "run aborted: no valid checkpoint left");
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl-C, stopping controller");
            anyhow::bail!("interrupted");
        }
    }
    Ok(())
}
