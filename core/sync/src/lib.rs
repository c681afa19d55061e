//! Tidesync sync engine
//!
//! Ties the local store, the outbox and a remote gateway together:
//! - Optimistic local mutations with per-mutation outcome handles
//! - Outbox draining with per-entity ordering and parallelism across entities
//! - Change-stream and pull-based ingestion of remote deltas
//! - Field-level conflict resolution with rebase of losing local edits
//! - Backoff while the remote store is unreachable
//! - Background task coordination

pub mod config;
pub mod conflict;
pub mod engine;
pub mod replica;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use config::SyncConfig;
pub use conflict::{acknowledge, apply_local, resolve, Outcome, Rebase, Resolution};
pub use engine::{DrainReport, PullReport, SyncEngine};
pub use replica::{MutationHandle, MutationOutcome, SyncEvent};
pub use retry::{is_retryable, Backoff, RetryConfig, RetryExecutor};
pub use scheduler::{SyncRequest, SyncResult, SyncScheduler};
pub use state::{CollectionState, CollectionStatus, Connectivity, Session, SyncState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _backoff = Backoff::new(RetryConfig::default());
        let _state = SyncState::new();
        assert!(Connectivity::Online.is_online());
    }
}
