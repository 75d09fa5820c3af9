//! Failure detection during a round.
//!
//! Two independent sources are polled in one loop: the failure sentinel in
//! the shared directory and the aggregation socket, on which the round's
//! last stage reports progress with fixed 4-byte acknowledgements. The
//! sentinel always wins when both fire in the same iteration.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use strand_stream::{RetryPolicy, SharedDir};

/// Size of one progress acknowledgement on the aggregation socket.
pub const ACK_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundSignal {
    /// The last stage reported progress; payload is the raw acknowledgement.
    Progressed([u8; ACK_SIZE]),
    /// A failure sentinel appeared or the aggregation peer disappeared.
    FailureDetected,
}

pub struct FailureDetector {
    shared: SharedDir,
    interval: Duration,
}

impl FailureDetector {
    pub fn new(shared: SharedDir, interval: Duration) -> Self {
        Self { shared, interval }
    }

    pub fn shared(&self) -> &SharedDir {
        &self.shared
    }

    /// Block until either the last stage reports progress on `source` or a
    /// failure is observed.
    pub async fn await_round_signal<R>(&self, source: &mut R) -> io::Result<RoundSignal>
    where
        R: AsyncRead + Unpin,
    {
        let mut ack = [0u8; ACK_SIZE];
        loop {
            if self.shared.failure_raised().await {
                warn!("failure sentinel observed");
                return Ok(RoundSignal::FailureDetected);
            }

            let n = match tokio::time::timeout(self.interval, source.read(&mut ack)).await {
                Err(_) => continue,
                Ok(result) => result?,
            };
            if n == 0 {
                warn!("aggregation peer closed the connection");
                return Ok(RoundSignal::FailureDetected);
            }
            if self.shared.failure_raised().await {
                warn!("failure sentinel observed alongside progress");
                return Ok(RoundSignal::FailureDetected);
            }
            if n < ACK_SIZE {
                if let Err(e) = source.read_exact(&mut ack[n..]).await {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        warn!("aggregation peer closed mid-acknowledgement");
                        return Ok(RoundSignal::FailureDetected);
                    }
                    return Err(e);
                }
            }
            debug!(ack = ?ack, "round progress acknowledged");
            return Ok(RoundSignal::Progressed(ack));
        }
    }
}

/// Double-marker completion check of partition `part`'s last stage.
///
/// When the kernel wrote `end_marker`, the controller removes it and waits
/// for `second_end_marker`. Returns `true` if that marker never appears,
/// which is treated as a failure of the previous round. A missing
/// `end_marker` is not a failure.
pub async fn finish_failed(end_marker: &Path, second_end_marker: &Path, policy: RetryPolicy) -> bool {
    if !tokio::fs::try_exists(end_marker).await.unwrap_or(false) {
        debug!(path = %end_marker.display(), "end marker was not created");
        return false;
    }
    if let Err(e) = tokio::fs::remove_file(end_marker).await {
        debug!(path = %end_marker.display(), error = %e, "end marker already gone");
    }
    for attempt in 1..=policy.attempts {
        if tokio::fs::try_exists(second_end_marker).await.unwrap_or(false) {
            info!(path = %second_end_marker.display(), "previous round confirmed finished");
            return false;
        }
        debug!(attempt, max = policy.attempts, "waiting for completion marker");
        policy.pause().await;
    }
    warn!(path = %second_end_marker.display(), "completion marker never appeared");
    true
}

// ── Tests ─────────────────────────────────────────────────────────────────────
