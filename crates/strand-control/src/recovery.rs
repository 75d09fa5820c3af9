//! Fleet restart after a failure or a checkpoint rollback.
//!
//! ```text
//! delete work<p> past the resume point
//!   → kill kernel + launcher on every node
//!   → reload config (fleet may have changed)
//!   → respawn launchers
//!   → reconnect (pruning), recompute vgpu, refit the split vector
//!   → clear the failure sentinel
//! ```

use std::io;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use strand_stream::RetryPolicy;
use strand_types::{ControllerConfig, HostSettings, WorkDir};

use crate::checkpoint::ResumePoint;
use crate::error::Result;
use crate::fleet::{self, FleetState};
use crate::process::{LaunchCommand, ProcessManager};

pub struct RecoveryManager<P> {
    layout: WorkDir,
    host: HostSettings,
    config_path: PathBuf,
    procs: P,
    connect: RetryPolicy,
}

impl<P: ProcessManager> RecoveryManager<P> {
    pub fn new(
        layout: WorkDir,
        host: HostSettings,
        config_path: PathBuf,
        procs: P,
        connect: RetryPolicy,
    ) -> Self {
        Self { layout, host, config_path, procs, connect }
    }

    pub fn procs(&self) -> &P {
        &self.procs
    }

    /// Restart the fleet so the round loop can continue at `resume`.
    /// `highest_part` is the highest partition launched so far.
    pub async fn recover(
        &self,
        state: &mut FleetState,
        resume: ResumePoint,
        highest_part: u32,
    ) -> Result<()> {
        info!(%resume, highest_part, "recovering fleet");

        self.discard_partitions(resume.part + 1..=highest_part).await;

        for node in &state.nodes {
            self.procs.kill_by_name(&node.spec, self.host.kernel_process()).await;
            self.procs.kill_by_name(&node.spec, &self.host.launcher).await;
        }
        state.disconnect_all().await;

        let config = ControllerConfig::load(&self.config_path)?;
        state.reload(config);

        for node in &state.nodes {
            let launch = LaunchCommand::launcher(&self.host, &node.spec, self.layout.root());
            self.procs.spawn(&node.spec, &launch).await;
        }

        state.part = resume.part;
        state.settle(resume.round);
        fleet::connect_fleet(state, &self.host, resume.round, self.connect).await?;
        state.settle(resume.round);

        match tokio::fs::remove_file(self.layout.failure_path()).await {
            Ok(()) => debug!("failure sentinel cleared"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "could not clear failure sentinel"),
        }

        info!(fleet = state.fleet(), vgpu = state.vgpu, %resume, "fleet recovered");
        Ok(())
    }

    async fn discard_partitions(&self, parts: std::ops::RangeInclusive<u32>) {
        for part in parts {
            let dir = self.layout.partition_dir(part);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(path = %dir.display(), "discarded partition directory"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), error = %e, "could not discard partition"),
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
