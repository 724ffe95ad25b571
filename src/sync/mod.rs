//! Synchronization of local segment edits with the revisioned remote document.
//!
//! This module provides:
//! - Wire shapes for documents, tracks and clips
//! - The per-document change propagation bus
//! - The persistence synchronizer (debounce, coalescing, OCC writes)
//! - The conflict reconciler (fetch, id-keyed merge, bounded retry)
//! - Document sessions tying the pieces to one open document

pub mod bus;
pub mod protocol;
pub mod reconcile;
pub mod scheduler;
pub mod session;
pub mod synchronizer;

pub use bus::{ChangeBus, DocumentChannel, Lane, Origin, SegmentsReplaced, Subscription};
pub use reconcile::ConflictReconciler;
pub use scheduler::{Scheduler, TokioScheduler};
pub use session::DocumentSession;
pub use synchronizer::{SyncHandle, SyncOutcome, SyncPhase, SyncStatus};

use std::time::Duration;
use thiserror::Error;

use crate::remote::RemoteError;
use crate::segment::DEFAULT_SEGMENT_DURATION;

/// Identifier of a remote document
pub type DocumentId = String;

/// Identifier of one editor surface within the process
pub type EditorId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the synchronizer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Revision conflicts persisted through every reconcile attempt
    #[error("Conflict unresolved after {attempts} attempts")]
    ConflictUnresolved { attempts: u32 },

    /// Network or server failure; not retried automatically
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered but refused the write
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// The synchronizer for this document has shut down
    #[error("Synchronizer closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Conflict { .. } => SyncError::ConflictUnresolved { attempts: 0 },
            RemoteError::NotFound(id) => SyncError::Transport(format!("Document not found: {}", id)),
            RemoteError::Transport(msg) => SyncError::Transport(msg),
        }
    }
}

/// Bounded linear backoff used by the conflict reconciler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(100),
        }
    }
}

/// Configuration for sync behavior
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after the last edit before a write is issued
    pub debounce: Duration,
    /// Reconcile attempts after a revision conflict
    pub max_conflict_attempts: u32,
    /// Backoff step between reconcile attempts (multiplied by attempt number)
    pub backoff_step: Duration,
    /// Duration of appended segments, in seconds
    pub default_segment_duration: f64,
    /// Per-document bus capacity
    pub bus_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            max_conflict_attempts: 3,
            backoff_step: Duration::from_millis(100),
            default_segment_duration: DEFAULT_SEGMENT_DURATION,
            bus_capacity: bus::DEFAULT_BUS_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `SEGMENT_SYNC_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_u64("SEGMENT_SYNC_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_u64("SEGMENT_SYNC_MAX_ATTEMPTS") {
            config.max_conflict_attempts = attempt_bound(attempts);
        }
        if let Some(ms) = env_u64("SEGMENT_SYNC_BACKOFF_MS") {
            config.backoff_step = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_max_conflict_attempts(mut self, attempts: u32) -> Self {
        self.max_conflict_attempts = attempts;
        self
    }

    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    /// Change bus sized for this configuration
    pub fn change_bus(&self) -> ChangeBus {
        ChangeBus::with_capacity(self.bus_capacity)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_conflict_attempts,
            backoff_step: self.backoff_step,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Saturate to `u32`; at least one attempt
fn attempt_bound(raw: u64) -> u32 {
    u32::try_from(raw).unwrap_or(u32::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::ConflictUnresolved { attempts: 3 };
        assert_eq!(err.to_string(), "Conflict unresolved after 3 attempts");
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert_eq!(config.max_conflict_attempts, 3);
        assert_eq!(config.default_segment_duration, 5.0);
    }

    #[test]
    fn test_attempt_bound_saturates() {
        assert_eq!(attempt_bound(0), 1);
        assert_eq!(attempt_bound(5), 5);
        assert_eq!(attempt_bound(u64::from(u32::MAX) + 1), u32::MAX);
        assert_eq!(attempt_bound(u64::MAX), u32::MAX);
    }

    #[test]
    fn test_retry_policy_backoff_is_linear() {
        let policy = SyncConfig::default()
            .with_backoff_step(Duration::from_millis(100))
            .retry_policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
    }

    #[test]
    fn test_remote_error_mapping() {
        let err: SyncError = RemoteError::Transport("connection reset".to_string()).into();
        assert_eq!(err, SyncError::Transport("connection reset".to_string()));
    }
}
