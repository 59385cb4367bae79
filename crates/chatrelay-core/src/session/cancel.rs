//! Per-session cancellation handle with a hard deadline.
//!
//! Explicit cancellation and the lifetime cap are one mechanism: the handle
//! reports cancelled once either the token fires or the deadline passes.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    deadline: Instant,
}

impl CancelHandle {
    /// Create a handle that fires on its own after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now() + timeout,
        }
    }

    /// Create a handle that is already cancelled.
    pub fn cancelled_now() -> Self {
        let handle = Self::with_timeout(Duration::ZERO);
        handle.token.cancel();
        handle
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the handle fired, explicitly or by deadline.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.timed_out()
    }

    pub fn timed_out(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Resolves once the handle fires.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_deadline() {
        let handle = CancelHandle::with_timeout(Duration::from_secs(900));
        assert!(!handle.is_cancelled());

        tokio::time::advance(Duration::from_secs(899)).await;
        assert!(!handle.is_cancelled());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(handle.is_cancelled());
        assert!(handle.timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_future_resolves_on_explicit_cancel() {
        let handle = CancelHandle::with_timeout(Duration::from_secs(900));
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        handle.cancel();
        task.await.unwrap();
        assert!(handle.is_cancelled());
        assert!(!handle.timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_future_resolves_on_deadline() {
        let handle = CancelHandle::with_timeout(Duration::from_secs(5));
        let start = Instant::now();
        handle.cancelled().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_cancelled_now() {
        assert!(CancelHandle::cancelled_now().is_cancelled());
    }
}
