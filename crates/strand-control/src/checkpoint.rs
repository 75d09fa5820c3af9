//! Checkpoint ledger and the recovery decision at round boundaries.
//!
//! ```text
//!   dispatch round r ──▶ register(out<p>.bin)      previous ← last, last ← new
//!
//!   boundary / failure ──▶ resolve()
//!        last valid ───────────────▶ Continue (normal) | Recover(last)
//!        previous valid ───────────▶ Recover(previous)  (roll back one round)
//!        neither, round < 2 ───────▶ Recover(origin)
//!        neither ──────────────────▶ Abort
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::validator::{self, UNAVAILABLE};

/// Where a resumed run starts: the next round to dispatch and the partition
/// counter before that round's first partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumePoint {
    pub round: u32,
    pub part: u32,
}

impl ResumePoint {
    pub const ORIGIN: Self = Self { round: 0, part: 0 };
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round {} / part {}", self.round, self.part)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Checkpoint {
    #[default]
    Unavailable,
    /// Column file written by the last stage of `round`, holding partition `part`.
    File { path: PathBuf, round: u32, part: u32 },
}

impl Checkpoint {
    pub fn path(&self) -> &Path {
        match self {
            Self::Unavailable => Path::new(UNAVAILABLE),
            Self::File { path, .. } => path,
        }
    }

    /// Resuming from this checkpoint re-enters at the round after the one
    /// that produced it.
    pub fn resume_point(&self) -> Option<ResumePoint> {
        match self {
            Self::Unavailable => None,
            Self::File { round, part, .. } => Some(ResumePoint { round: round + 1, part: *part }),
        }
    }

    async fn is_valid(&self, sequence: &Path) -> bool {
        match self {
            Self::Unavailable => false,
            Self::File { path, .. } => validator::is_valid(path, sequence).await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Normal boundary with a good checkpoint: keep going.
    Continue,
    /// Restart the fleet and resume at the given point.
    Recover(ResumePoint),
    /// Nothing valid to resume from.
    Abort,
}

#[derive(Debug, Default)]
pub struct CheckpointLedger {
    last: Checkpoint,
    previous: Checkpoint,
    resume: ResumePoint,
}

impl CheckpointLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> &Checkpoint {
        &self.last
    }

    pub fn previous(&self) -> &Checkpoint {
        &self.previous
    }

    pub fn resume(&self) -> ResumePoint {
        self.resume
    }

    /// Record the checkpoint a just-dispatched round will produce.
    pub fn register(&mut self, checkpoint: Checkpoint) {
        self.previous = std::mem::replace(&mut self.last, checkpoint);
    }

    /// Decide how to proceed at a round boundary. `round` is the round about
    /// to run (or the round that just failed).
    pub async fn resolve(&mut self, round: u32, failed: bool, sequence: &Path) -> Resolution {
        if self.last.is_valid(sequence).await {
            if let Some(point) = self.last.resume_point() {
                self.resume = point;
            }
            info!(path = %self.last.path().display(), resume = %self.resume, "checkpoint valid");
            return if failed { Resolution::Recover(self.resume) } else { Resolution::Continue };
        }

        warn!(path = %self.last.path().display(), "last checkpoint invalid");
        if self.previous.is_valid(sequence).await {
            if let Some(point) = self.previous.resume_point() {
                self.resume = point;
            }
            info!(path = %self.previous.path().display(), resume = %self.resume, "rolling back one round");
            self.last = std::mem::take(&mut self.previous);
            return Resolution::Recover(self.resume);
        }

        if round < 2 {
            info!("no usable checkpoint; restarting from the beginning");
            self.last = Checkpoint::Unavailable;
            self.previous = Checkpoint::Unavailable;
            self.resume = ResumePoint::ORIGIN;
            return Resolution::Recover(self.resume);
        }

        warn!(round, "both checkpoints invalid");
        Resolution::Abort
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strand_types::CELL_SIZE;

    struct Fixture {
        dir: tempfile::TempDir,
        seq: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let seq = dir.path().join("a.fasta");
            std::fs::write(&seq, ">a\nACGTACGTAC\n").unwrap();
            Self { dir, seq }
        }

        fn checkpoint(&self, round: u32, part: u32, valid: bool) -> Checkpoint {
            let path = self.dir.path().join(format!("out{part}.bin"));
            let cells = if valid { 10 } else { 3 };
            std::fs::write(&path, vec![0u8; cells * CELL_SIZE]).unwrap();
            Checkpoint::File { path, round, part }
        }
    }

    #[tokio::test]
    async fn valid_last_continues() {
        let fx = Fixture::new();
        let mut ledger = CheckpointLedger::new();
        ledger.register(fx.checkpoint(0, 4, true));

        assert_eq!(ledger.resolve(1, false, &fx.seq).await, Resolution::Continue);
        assert_eq!(ledger.resume(), ResumePoint { round: 1, part: 4 });
    }

    #[tokio::test]
    async fn invalid_last_rolls_back_to_previous() {
        let fx = Fixture::new();
        let mut ledger = CheckpointLedger::new();
        ledger.register(fx.checkpoint(0, 4, true));
        ledger.register(fx.checkpoint(1, 8, false));

        let resolution = ledger.resolve(1, true, &fx.seq).await;
        assert_eq!(resolution, Resolution::Recover(ResumePoint { round: 1, part: 4 }));
        assert_eq!(ledger.last().path(), fx.dir.path().join("out4.bin"));
        assert_eq!(ledger.previous(), &Checkpoint::Unavailable);
    }

    #[tokio::test]
    async fn early_failure_restarts_from_origin() {
        let fx = Fixture::new();
        let mut ledger = CheckpointLedger::new();
        ledger.register(fx.checkpoint(0, 4, false));

        let resolution = ledger.resolve(0, true, &fx.seq).await;
        assert_eq!(resolution, Resolution::Recover(ResumePoint::ORIGIN));
        assert_eq!(ledger.last(), &Checkpoint::Unavailable);
    }

    #[tokio::test]
    async fn late_double_loss_aborts() {
        let fx = Fixture::new();
        let mut ledger = CheckpointLedger::new();
        ledger.register(fx.checkpoint(1, 8, false));
        ledger.register(fx.checkpoint(2, 12, false));

        assert_eq!(ledger.resolve(2, true, &fx.seq).await, Resolution::Abort);
    }

    #[tokio::test]
    async fn final_round_failure_retries_last_round() {
        let fx = Fixture::new();
        let mut ledger = CheckpointLedger::new();
        ledger.register(fx.checkpoint(1, 8, true));
        ledger.register(Checkpoint::Unavailable);

        let resolution = ledger.resolve(2, true, &fx.seq).await;
        assert_eq!(resolution, Resolution::Recover(ResumePoint { round: 2, part: 8 }));
    }
}
