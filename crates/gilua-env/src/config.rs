use std::time::Duration;

use gilua::DEFAULT_CHECK_INTERVAL;

/// Limits and configuration for an [`Environment`](crate::Environment).
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Maximum wall-clock duration of one run or callback invocation. `None`
    /// lets scripts run until the environment is closed.
    pub timeout: Option<Duration>,
    /// Instructions between two cancellation checks.
    pub check_interval: u32,
    /// Forward captured `print` lines to `tracing`.
    pub echo_print: bool,
    /// Captured `print` lines kept before the oldest are dropped.
    pub max_log_lines: usize,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(60)),
            check_interval: DEFAULT_CHECK_INTERVAL,
            echo_print: true,
            max_log_lines: 10_000,
        }
    }
}

impl EnvConfig {
    /// Set the per-run timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Let runs go on until cancelled.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set the cancellation polling interval, in instructions.
    pub fn with_check_interval(mut self, interval: u32) -> Self {
        self.check_interval = interval.max(1);
        self
    }
}
