//! External decision program for `MODEL decision`.
//!
//! The program is started as `PROG <seq0> <seq1> <gflops budget>` and
//! publishes its verdict in `<PROG>.txt`: `-` while still deciding, `1` or
//! `2` to veto dynamic rebalancing, anything else to let it proceed.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::Result;

const PENDING: u8 = b'-';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Veto,
}

impl Verdict {
    fn from_byte(byte: u8) -> Self {
        match byte {
            b'1' | b'2' => Self::Veto,
            _ => Self::Proceed,
        }
    }
}

pub struct DecisionModule {
    verdict_path: PathBuf,
    poll: Duration,
}

impl DecisionModule {
    /// Watch `verdict_path` without starting anything.
    pub fn watch(verdict_path: impl Into<PathBuf>, poll: Duration) -> Self {
        Self { verdict_path: verdict_path.into(), poll }
    }

    /// Start `prog` in the background and watch `<prog>.txt`.
    pub async fn launch(prog: &str, seq0: &Path, seq1: &Path, budget: u64, poll: Duration) -> Result<Self> {
        let module = Self::watch(format!("{prog}.txt"), poll);
        match tokio::fs::remove_file(&module.verdict_path).await {
            Ok(()) => debug!(path = %module.verdict_path.display(), "removed stale verdict"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let child = Command::new(prog)
            .arg(seq0)
            .arg(seq1)
            .arg(budget.to_string())
            .stdin(Stdio::null())
            .spawn()?;
        info!(prog, budget, pid = ?child.id(), "decision module started");
        Ok(module)
    }

    pub fn verdict_path(&self) -> &Path {
        &self.verdict_path
    }

    /// Wait for the program's first verdict.
    pub async fn initial_verdict(&self) -> Verdict {
        loop {
            match tokio::fs::read(&self.verdict_path).await {
                Ok(bytes) if !bytes.is_empty() && bytes[0] != PENDING => {
                    let verdict = Verdict::from_byte(bytes[0]);
                    info!(?verdict, "decision module answered");
                    return verdict;
                }
                _ => tokio::time::sleep(self.poll).await,
            }
        }
    }

    /// Re-read the verdict at a rebalancing step, waiting while the program
    /// is still deciding. A vanished verdict file lets rebalancing proceed.
    pub async fn round_verdict(&self) -> Verdict {
        loop {
            match tokio::fs::read(&self.verdict_path).await {
                Ok(bytes) if bytes.first() == Some(&PENDING) => {
                    tokio::time::sleep(self.poll).await;
                }
                Ok(bytes) => {
                    let verdict = bytes.first().copied().map(Verdict::from_byte).unwrap_or(Verdict::Proceed);
                    debug!(?verdict, "decision verdict for this round");
                    return verdict;
                }
                Err(e) => {
                    warn!(path = %self.verdict_path.display(), error = %e, "verdict unreadable");
                    return Verdict::Proceed;
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initial_veto() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decide.txt");
        let module = DecisionModule::watch(&path, Duration::from_millis(1));

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                std::fs::write(&path, b"2").unwrap();
            })
        };
        assert_eq!(module.initial_verdict().await, Verdict::Veto);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn round_verdict_waits_while_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decide.txt");
        std::fs::write(&path, b"-").unwrap();
        let module = DecisionModule::watch(&path, Duration::from_millis(1));

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                std::fs::write(&path, b"0").unwrap();
            })
        };
        assert_eq!(module.round_verdict().await, Verdict::Proceed);
        writer.await.unwrap();

        std::fs::write(&path, b"1").unwrap();
        assert_eq!(module.round_verdict().await, Verdict::Veto);
    }
}
