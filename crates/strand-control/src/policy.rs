//! Timeouts and retry budgets of the control path.

use std::time::Duration;

use strand_stream::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPolicies {
    /// Control-socket connect: 3 attempts, 3 s apart.
    pub connect: RetryPolicy,
    /// Poll spacing of the failure detector. Sub-millisecond values are
    /// rounded up to the tokio timer resolution of 1 ms.
    pub detector_interval: Duration,
    /// Double-marker completion wait: 15 polls, 2 s apart.
    pub finish: RetryPolicy,
    /// Waiting for a throughput log to appear.
    pub throughput_log: RetryPolicy,
    /// Poll spacing while the decision module is still deciding.
    pub decision_poll: Duration,
    /// Pause between the last round and the `END|` broadcast.
    pub shutdown_grace: Duration,
}

impl Default for ControlPolicies {
    fn default() -> Self {
        Self {
            connect: RetryPolicy::new(3, Duration::from_secs(3)),
            detector_interval: Duration::from_micros(100),
            finish: RetryPolicy::new(15, Duration::from_secs(2)),
            throughput_log: RetryPolicy::new(10, Duration::from_secs(6)),
            decision_poll: Duration::from_micros(100),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl ControlPolicies {
    /// Millisecond-scale budgets for tests.
    #[cfg(test)]
    pub(crate) fn fast() -> Self {
        Self {
            connect: RetryPolicy::new(3, Duration::from_millis(5)),
            detector_interval: Duration::from_millis(1),
            finish: RetryPolicy::new(3, Duration::from_millis(5)),
            throughput_log: RetryPolicy::new(2, Duration::from_millis(5)),
            decision_poll: Duration::from_millis(1),
            shutdown_grace: Duration::from_millis(1),
        }
    }
}
