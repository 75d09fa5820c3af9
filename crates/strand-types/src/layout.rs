//! Working-directory layout shared by the controller, the launchers and the
//! kernel.
//!
//! ```text
//! <root>/share/failure.txt        failure declared by any party
//! <root>/share/closesocket.txt    graceful writer-side close
//! <root>/share/out<part>.bin      round checkpoint written by a round's last stage
//! <root>/work<part>/              per-partition kernel working directory
//!     dynend.txt, dynend1.txt     double-marker completion protocol
//!     inputBuffer.log             throughput log of a round's last stage
//!     outputBuffer.log            throughput log of every other stage
//! <root>/rebalance.txt            rebalancing journal
//! <root>/statistics.txt           run statistics
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const FAILURE_FILE: &str = "failure.txt";
pub const CLOSE_SOCKET_FILE: &str = "closesocket.txt";
pub const END_MARKER: &str = "dynend.txt";
pub const SECOND_END_MARKER: &str = "dynend1.txt";
pub const INPUT_LOG: &str = "inputBuffer.log";
pub const OUTPUT_LOG: &str = "outputBuffer.log";

/// Filesystem rendezvous point for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the shared directory if it does not exist yet.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.share_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn share_dir(&self) -> PathBuf {
        self.root.join("share")
    }

    pub fn failure_path(&self) -> PathBuf {
        self.share_dir().join(FAILURE_FILE)
    }

    pub fn checkpoint_path(&self, part: u32) -> PathBuf {
        self.share_dir().join(format!("out{part}.bin"))
    }

    pub fn partition_dir(&self, part: u32) -> PathBuf {
        self.root.join(format!("work{part}"))
    }

    pub fn end_marker(&self, part: u32) -> PathBuf {
        self.partition_dir(part).join(END_MARKER)
    }

    pub fn second_end_marker(&self, part: u32) -> PathBuf {
        self.partition_dir(part).join(SECOND_END_MARKER)
    }

    /// Throughput log of partition `part`; the last stage of a round only
    /// records its input side.
    pub fn throughput_log(&self, part: u32, last_stage: bool) -> PathBuf {
        let name = if last_stage { INPUT_LOG } else { OUTPUT_LOG };
        self.partition_dir(part).join(name)
    }

    pub fn rebalance_journal(&self) -> PathBuf {
        self.root.join("rebalance.txt")
    }

    pub fn statistics_path(&self) -> PathBuf {
        self.root.join("statistics.txt")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
