use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::CancelReason;

/// Instructions between two cancellation checks when nothing else is set.
pub const DEFAULT_CHECK_INTERVAL: u32 = 1000;

/// Cancellation signal for a script run: a token, an optional deadline, and
/// how often the cancellation hook polls them.
///
/// A smaller `check_interval` makes a running script react to cancellation
/// sooner at the cost of more hook invocations per instruction executed.
#[derive(Debug, Clone)]
pub struct CancelContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    check_interval: u32,
}

impl CancelContext {
    /// A fresh context that is never cancelled unless asked to.
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// A context driven by an existing token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Add a deadline `timeout` from now. An earlier deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Add a deadline. An earlier deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Poll every `interval` instructions. Zero is treated as one.
    pub fn with_check_interval(mut self, interval: u32) -> Self {
        self.check_interval = interval.max(1);
        self
    }

    /// A context cancelled together with this one, which can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            check_interval: self.check_interval,
        }
    }

    /// Trigger cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the run should stop, for either reason.
    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Why the run should stop, if it should. An explicit cancel wins over an
    /// expired deadline.
    pub fn err(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            Some(CancelReason::Canceled)
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(CancelReason::DeadlineExceeded)
        } else {
            None
        }
    }

    /// The underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn check_interval(&self) -> u32 {
        self.check_interval
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => CancelReason::Canceled,
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        self.err().unwrap_or(CancelReason::DeadlineExceeded)
                    }
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Canceled
            }
        }
    }
}

impl Default for CancelContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_children() {
        let parent = CancelContext::new();
        let child = parent.child();
        assert_eq!(child.err(), None);

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert_eq!(other.err(), Some(CancelReason::Canceled));
    }

    #[test]
    fn earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = CancelContext::new()
            .with_deadline(now + Duration::from_secs(10))
            .with_deadline(now + Duration::from_secs(5))
            .with_deadline(now + Duration::from_secs(20));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(5)));

        let expired = CancelContext::new().with_deadline(now);
        assert_eq!(expired.err(), Some(CancelReason::DeadlineExceeded));
        expired.cancel();
        assert_eq!(expired.err(), Some(CancelReason::Canceled));
    }

    #[test]
    fn check_interval_is_at_least_one() {
        assert_eq!(CancelContext::new().check_interval(), DEFAULT_CHECK_INTERVAL);
        assert_eq!(CancelContext::new().with_check_interval(0).check_interval(), 1);
    }

    #[tokio::test]
    async fn done_resolves_on_deadline() {
        let ctx = CancelContext::new().with_timeout(Duration::from_millis(20));
        assert_eq!(ctx.done().await, CancelReason::DeadlineExceeded);

        let ctx = CancelContext::new();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.done().await })
        };
        ctx.cancel();
        assert_eq!(waiter.await.unwrap(), CancelReason::Canceled);
    }
}
