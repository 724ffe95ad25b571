//! Timer port used for debounce and backoff.
//!
//! The synchronizer never calls `tokio::time` directly; it asks its scheduler.
//! `TokioScheduler` follows the runtime clock, so tests that pause time
//! (`start_paused = true`) drive every timer deterministically.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait Scheduler: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Resolves once `deadline` has passed. Dropping the future cancels it.
    async fn sleep_until(&self, deadline: Instant);

    async fn sleep(&self, duration: Duration) {
        self.sleep_until(self.now() + duration).await
    }
}

/// Scheduler backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_advances_virtual_time() {
        let scheduler = TokioScheduler;
        let started = scheduler.now();

        scheduler.sleep(Duration::from_millis(300)).await;

        assert!(scheduler.now() - started >= Duration::from_millis(300));
    }
}
