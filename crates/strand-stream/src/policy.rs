//! Bounded retry policies for the stream roles.
//!
//! Production values: socket I/O retries 3 times with 2 s spacing, initial
//! connection tolerates an unbound peer for 3000 × 10 ms.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const SOCKET_IO: Self = Self::new(3, Duration::from_secs(2));
    pub const CONNECT: Self = Self::new(3000, Duration::from_millis(10));

    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    pub async fn pause(&self) {
        tokio::time::sleep(self.backoff).await;
    }
}

/// Policies used by one stream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPolicy {
    /// Send/receive retries and the close handshake.
    pub io: RetryPolicy,
    /// Initial connect of the downstream reader.
    pub connect: RetryPolicy,
    /// How long a writability probe may wait before it counts as "not writable".
    pub probe: Duration,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            io: RetryPolicy::SOCKET_IO,
            connect: RetryPolicy::CONNECT,
            probe: Duration::from_millis(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_defaults() {
        let p = StreamPolicy::default();
        assert_eq!(p.io.attempts, 3);
        assert_eq!(p.io.backoff, Duration::from_secs(2));
        assert_eq!(p.connect.attempts, 3000);
        assert_eq!(p.connect.backoff, Duration::from_millis(10));
    }
}
