//! Sentinel files in the shared directory.
//!
//! The filesystem doubles as a failure-notification channel: a stage that
//! crashes before its socket exists can still be observed through it.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use strand_types::layout::{CLOSE_SOCKET_FILE, FAILURE_FILE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDir {
    dir: PathBuf,
}

impl SharedDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn failure_path(&self) -> PathBuf {
        self.dir.join(FAILURE_FILE)
    }

    pub fn close_socket_path(&self) -> PathBuf {
        self.dir.join(CLOSE_SOCKET_FILE)
    }

    /// Create the failure sentinel unless some other party already did.
    /// Returns `true` if this call created it.
    pub async fn raise_failure(&self) -> bool {
        match create_marker(&self.failure_path()).await {
            Ok(created) => {
                if created {
                    warn!(path = %self.failure_path().display(), "failure signal raised");
                }
                created
            }
            Err(e) => {
                warn!(error = %e, "could not create failure sentinel");
                false
            }
        }
    }

    pub async fn failure_raised(&self) -> bool {
        exists(&self.failure_path()).await
    }

    /// Mark a graceful writer-side close.
    pub async fn mark_socket_closed(&self) -> io::Result<()> {
        create_marker(&self.close_socket_path()).await.map(|_| ())
    }

    /// `true` if the upstream peer ended normally: either it marked its
    /// socket closed or the kernel's end-of-execution marker exists.
    pub async fn peer_finished(&self, end_signal: &Path) -> bool {
        exists(end_signal).await || exists(&self.close_socket_path()).await
    }

    /// Remove markers left behind by a previous attempt.
    pub async fn clear_stale(&self) {
        for path in [self.close_socket_path(), self.failure_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "removed stale sentinel"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove sentinel"),
            }
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Create an empty file; `Ok(false)` if it already existed.
async fn create_marker(path: &Path) -> io::Result<bool> {
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
