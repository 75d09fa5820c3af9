//! Remote process control: starting worker launchers and killing stage
//! processes by name, locally or over ssh.
//!
//! Every operation is best-effort. Failures are logged and otherwise
//! ignored; a launcher that did not come up is caught by the fleet connect
//! that follows.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use strand_types::{HostSettings, NodeSpec};

/// A program started in `dir` on some node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
}

impl LaunchCommand {
    /// `<launcher> <device> <workdir>` started from the launcher directory.
    pub fn launcher(host: &HostSettings, node: &NodeSpec, workdir: &Path) -> Self {
        Self {
            program: host.launcher.clone(),
            args: vec![node.device.to_string(), workdir.display().to_string()],
            dir: host.launcher_dir.clone(),
        }
    }

    fn shell_line(&self) -> String {
        format!(
            "cd {} && ./{} {}",
            self.dir.display(),
            self.program,
            self.args.join(" ")
        )
    }
}

#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Start `command` on `node` without waiting for it.
    async fn spawn(&self, node: &NodeSpec, command: &LaunchCommand);

    /// Kill every process called `name` on `node`. Idempotent.
    async fn kill_by_name(&self, node: &NodeSpec, name: &str);
}

/// Local processes for nodes at the controller's address, ssh for the rest.
pub struct ShellProcessManager {
    controller_ip: String,
    ssh_user: String,
}

impl ShellProcessManager {
    pub fn new(host: &HostSettings) -> Self {
        Self {
            controller_ip: host.controller_ip.clone(),
            ssh_user: host.ssh_user.clone(),
        }
    }

    fn remote(&self, node: &NodeSpec) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg(format!("{}@{}", self.ssh_user, node.address));
        cmd
    }
}

#[async_trait]
impl ProcessManager for ShellProcessManager {
    async fn spawn(&self, node: &NodeSpec, command: &LaunchCommand) {
        let mut cmd = if node.is_local(&self.controller_ip) {
            let mut cmd = Command::new(command.dir.join(&command.program));
            cmd.args(&command.args).current_dir(&command.dir);
            cmd
        } else {
            let mut cmd = self.remote(node);
            cmd.arg(command.shell_line());
            cmd
        };
        cmd.stdin(Stdio::null());

        match cmd.spawn() {
            Ok(child) => info!(
                node = %node.address,
                device = node.device,
                pid = ?child.id(),
                program = %command.program,
                "launcher started"
            ),
            Err(e) => warn!(
                node = %node.address,
                device = node.device,
                error = %e,
                "failed to start launcher"
            ),
        }
    }

    async fn kill_by_name(&self, node: &NodeSpec, name: &str) {
        let mut cmd = if node.is_local(&self.controller_ip) {
            Command::new("pkill")
        } else {
            let mut cmd = self.remote(node);
            cmd.arg("pkill");
            cmd
        };
        cmd.arg(name).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

        match cmd.status().await {
            Ok(status) => debug!(node = %node.address, name, ?status, "kill by name"),
            Err(e) => warn!(node = %node.address, name, error = %e, "kill by name failed"),
        }
    }
}

// ── Test double ──────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Spawn { address: String, device: u32, program: String },
        Kill { address: String, name: String },
    }

    /// Records every call instead of touching real processes.
    #[derive(Default)]
    pub struct RecordingProcessManager {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingProcessManager {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessManager for RecordingProcessManager {
        async fn spawn(&self, node: &NodeSpec, command: &LaunchCommand) {
            self.calls.lock().unwrap().push(Call::Spawn {
                address: node.address.clone(),
                device: node.device,
                program: command.program.clone(),
            });
        }

        async fn kill_by_name(&self, node: &NodeSpec, name: &str) {
            self.calls.lock().unwrap().push(Call::Kill {
                address: node.address.clone(),
                name: name.to_string(),
            });
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
