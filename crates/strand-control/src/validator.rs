//! Checkpoint validation: a checkpoint is usable only if it holds exactly one
//! cell per residue of the vertical sequence.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, warn};

use strand_types::CELL_SIZE;

/// Path literal meaning "no checkpoint exists".
pub const UNAVAILABLE: &str = "unavailable";

/// `true` if `checkpoint` exists and its cell count equals the residue count
/// of `sequence` (every byte after the header line except `\r`, `\n` and
/// spaces). The cell count is `size / CELL_SIZE`, so a trailing partial cell
/// does not invalidate the file. Unreadable files are simply invalid.
pub async fn is_valid(checkpoint: &Path, sequence: &Path) -> bool {
    if checkpoint.as_os_str() == UNAVAILABLE {
        return false;
    }
    let size = match tokio::fs::metadata(checkpoint).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            debug!(path = %checkpoint.display(), error = %e, "checkpoint missing");
            return false;
        }
    };
    let residues = match count_residues(sequence).await {
        Ok(n) => n,
        Err(e) => {
            warn!(path = %sequence.display(), error = %e, "cannot read sequence");
            return false;
        }
    };
    let cells = size / CELL_SIZE as u64;
    let valid = cells == residues;
    debug!(
        path = %checkpoint.display(),
        cells,
        residues,
        valid,
        "checkpoint validated"
    );
    valid
}

async fn count_residues(sequence: &Path) -> std::io::Result<u64> {
    let file = tokio::fs::File::open(sequence).await?;
    let mut reader = BufReader::new(file);

    let mut header = Vec::new();
    reader.read_until(b'\n', &mut header).await?;

    let mut count = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(count);
        }
        count += buf[..n]
            .iter()
            .filter(|b| !matches!(b, b'\r' | b'\n' | b' '))
            .count() as u64;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
