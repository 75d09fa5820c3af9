//! Per-stage throughput taken from the kernel's buffer logs.
//!
//! Each partition directory holds a whitespace-separated log, one line per
//! sample. Only the last line matters. A round's last stage logs its input
//! side (`inputBuffer.log`: rate = column 14 + column 16); every other stage
//! logs its output side (`outputBuffer.log`: rate = column 17).

use std::path::Path;

use tracing::{debug, warn};

use strand_stream::RetryPolicy;

const INPUT_COLUMNS: [usize; 2] = [14, 16];
const OUTPUT_COLUMNS: [usize; 1] = [17];

/// Last non-empty line of `text`.
pub fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().find(|line| !line.trim().is_empty())
}

/// Rate encoded in one log line. Missing or unparsable columns count as 0.
pub fn parse_rate(line: &str, last_stage: bool) -> f64 {
    let columns: &[usize] = if last_stage { &INPUT_COLUMNS } else { &OUTPUT_COLUMNS };
    let tokens: Vec<&str> = line.split_whitespace().collect();
    columns
        .iter()
        .map(|&col| {
            tokens
                .get(col - 1)
                .and_then(|tok| tok.parse::<f64>().ok())
                .unwrap_or(0.0)
        })
        .sum()
}

/// Read the rate recorded in `path`, waiting for the file to appear.
///
/// Returns `None` if the log never shows up within `policy`; the caller
/// treats that as a zero rate.
pub async fn read_rate(path: &Path, last_stage: bool, policy: RetryPolicy) -> Option<f64> {
    for attempt in 1..=policy.attempts {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let rate = last_line(&text).map(|l| parse_rate(l, last_stage)).unwrap_or(0.0);
                debug!(path = %path.display(), rate, "throughput sample");
                return Some(rate);
            }
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "throughput log not ready");
                if attempt < policy.attempts {
                    policy.pause().await;
                }
            }
        }
    }
    warn!(path = %path.display(), "throughput log never appeared");
    None
}

/// Render a log line with `values` at the given 1-based columns and zeros
/// elsewhere. Used by tests that stand in for the kernel.
#[cfg(test)]
pub(crate) fn sample_line(values: &[(usize, f64)]) -> String {
    let width = values.iter().map(|(c, _)| *c).max().unwrap_or(0).max(17);
    (1..=width)
        .map(|col| {
            values
                .iter()
                .find(|(c, _)| *c == col)
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| "0".into())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn picks_last_non_empty_line() {
        assert_eq!(last_line("a\nb\n\n"), Some("b"));
        assert_eq!(last_line(""), None);
    }

    #[test]
    fn input_log_sums_two_columns() {
        let line = sample_line(&[(14, 1.5), (16, 0.5), (17, 9.0)]);
        assert_eq!(parse_rate(&line, true), 2.0);
        assert_eq!(parse_rate(&line, false), 9.0);
    }

    #[test]
    fn short_line_reads_as_zero() {
        assert_eq!(parse_rate("1 2 3", false), 0.0);
    }

    #[tokio::test]
    async fn missing_log_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        assert_eq!(read_rate(&dir.path().join("none.log"), false, policy).await, None);
    }

    #[tokio::test]
    async fn reads_latest_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputBuffer.log");
        let text = format!(
            "{}\n{}\n",
            sample_line(&[(17, 1.0)]),
            sample_line(&[(17, 3.0)])
        );
        std::fs::write(&path, text).unwrap();
        let policy = RetryPolicy::new(1, Duration::from_millis(1));
        assert_eq!(read_rate(&path, false, policy).await, Some(3.0));
    }
}
