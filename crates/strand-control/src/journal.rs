// Append-only rebalancing journal (`rebalance.txt`) and the end-of-run
// statistics file. Both are diagnostics: write errors are logged, never
// propagated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::split::Proposal;

pub struct RebalanceJournal {
    path: PathBuf,
}

impl RebalanceJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one steady-state update of the slice starting at `start`.
    pub async fn record(
        &self,
        round: u32,
        start: usize,
        previous: &[u32],
        rates: &[f64],
        proposal: &Proposal,
        split: &[u32],
    ) {
        let fleet = previous.len();
        let mut entry = format!(
            "[{}] round {round} balanced={}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            proposal.balanced
        );
        for (j, ((old, rate), new)) in previous.iter().zip(rates).zip(&proposal.raw).enumerate() {
            entry.push_str(&format!(
                "  old[{}]={old} rate={rate} new[{}]={new}\n",
                start - fleet + j,
                start + j
            ));
        }
        let split: Vec<String> = split.iter().map(u32::to_string).collect();
        entry.push_str(&format!("  split={}\n", split.join(",")));
        self.append(&entry).await;
    }

    async fn append(&self, text: &str) {
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(text.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "could not write rebalance journal");
        }
    }
}

/// Write `Execution time: <ms>` to the statistics file.
pub async fn write_statistics(path: &Path, elapsed: Duration) {
    let text = format!(
        "Execution time: {}\nFinished: {}\n",
        elapsed.as_millis(),
        chrono::Local::now().to_rfc3339()
    );
    if let Err(e) = tokio::fs::write(path, text).await {
        warn!(path = %path.display(), error = %e, "could not write statistics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RebalanceJournal::new(dir.path().join("rebalance.txt"));
        let proposal = Proposal { raw: vec![250, 500], balanced: true };

        journal.record(0, 2, &[500, 500], &[0.5, 1.0], &proposal, &[500, 500, 333, 667]).await;
        journal.record(1, 4, &[333, 667], &[1.0, 1.0], &proposal, &[500, 500, 333, 667]).await;

        let text = std::fs::read_to_string(journal.path()).unwrap();
        assert_eq!(text.matches("balanced=true").count(), 2);
        assert!(text.contains("old[0]=500 rate=0.5 new[2]=250"));
        assert!(text.contains("split=500,500,333,667"));
    }

    #[tokio::test]
    async fn statistics_report_milliseconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statistics.txt");
        write_statistics(&path, Duration::from_millis(1234)).await;
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Execution time: 1234\n"));
    }
}
