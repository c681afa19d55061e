//! Sync state tracking: connectivity, session and per-collection status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use tidesync_common::{CollectionName, Error, ReplicaId, Result, Version};

/// Whether the remote store is believed reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

/// Identity an engine runs under, created on start and dropped on sign-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub replica_id: ReplicaId,
    /// Opaque token produced by the authentication flow.
    token: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            token: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// Lifecycle of one collection's synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionState {
    /// Not started.
    Idle,
    /// Opening the change stream (or resyncing).
    Subscribing,
    /// Applying remote deltas as they arrive.
    Streaming,
    /// Pushing local mutations.
    Draining,
    /// Remote unreachable; waiting to reconnect.
    Suspended,
}

impl CollectionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: CollectionState) -> bool {
        use CollectionState::*;
        if self == next || next == Idle {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Subscribing)
                | (Idle, Draining)
                | (Subscribing, Streaming)
                | (Subscribing, Suspended)
                | (Streaming, Draining)
                | (Streaming, Subscribing)
                | (Streaming, Suspended)
                | (Draining, Streaming)
                | (Draining, Idle)
                | (Draining, Suspended)
                | (Suspended, Subscribing)
                | (Suspended, Draining)
        )
    }
}

impl fmt::Display for CollectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectionState::Idle => "idle",
            CollectionState::Subscribing => "subscribing",
            CollectionState::Streaming => "streaming",
            CollectionState::Draining => "draining",
            CollectionState::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Status of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub collection: CollectionName,
    pub state: CollectionState,
    /// State to return to when a drain ends.
    resume_to: CollectionState,
    /// Highest remote version applied.
    pub watermark: Version,
    pub last_synced: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub resyncs: u32,
}

impl CollectionStatus {
    pub fn new(collection: CollectionName) -> Self {
        Self {
            collection,
            state: CollectionState::Idle,
            resume_to: CollectionState::Idle,
            watermark: Version::ZERO,
            last_synced: None,
            failure_count: 0,
            last_error: None,
            resyncs: 0,
        }
    }

    /// Move to `next`, refusing illegal transitions.
    pub fn transition(&mut self, next: CollectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidInput(format!(
                "{}: illegal transition {} -> {}",
                self.collection, self.state, next
            )));
        }
        if self.state != next {
            debug!("{}: {} -> {}", self.collection, self.state, next);
        }
        self.state = next;
        Ok(())
    }

    pub fn mark_subscribing(&mut self) -> Result<()> {
        self.transition(CollectionState::Subscribing)
    }

    /// Stream is live and caught up to `watermark`.
    pub fn mark_streaming(&mut self, watermark: Version) -> Result<()> {
        self.transition(CollectionState::Streaming)?;
        self.watermark = self.watermark.max(watermark);
        self.last_synced = Some(Utc::now());
        self.failure_count = 0;
        self.last_error = None;
        Ok(())
    }

    /// A drain starts; remembers where to return afterwards.
    pub fn mark_draining(&mut self) -> Result<()> {
        if self.state != CollectionState::Draining {
            self.resume_to = self.state;
        }
        self.transition(CollectionState::Draining)
    }

    /// A drain ended; return to the state it interrupted.
    pub fn finish_draining(&mut self) -> Result<()> {
        if self.state != CollectionState::Draining {
            return Ok(());
        }
        let back = match self.resume_to {
            CollectionState::Streaming => CollectionState::Streaming,
            _ => CollectionState::Idle,
        };
        self.transition(back)
    }

    pub fn mark_suspended(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(CollectionState::Suspended)?;
        self.failure_count += 1;
        let error = error.into();
        warn!("{} suspended: {}", self.collection, error);
        self.last_error = Some(error);
        Ok(())
    }

    /// A batch of remote changes up to `watermark` was applied.
    pub fn record_batch(&mut self, watermark: Version) {
        self.watermark = self.watermark.max(watermark);
        self.last_synced = Some(Utc::now());
    }

    pub fn mark_resynced(&mut self, watermark: Version) {
        self.resyncs += 1;
        self.watermark = self.watermark.max(watermark);
        self.last_synced = Some(Utc::now());
    }

    pub fn mark_idle(&mut self) {
        self.state = CollectionState::Idle;
    }
}

/// Per-collection sync state of an engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    collections: BTreeMap<CollectionName, CollectionStatus>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: &CollectionName) -> Option<&CollectionStatus> {
        self.collections.get(collection)
    }

    /// Status of a collection, created on first use.
    pub fn status_mut(&mut self, collection: &CollectionName) -> &mut CollectionStatus {
        self.collections
            .entry(collection.clone())
            .or_insert_with(|| CollectionStatus::new(collection.clone()))
    }

    pub fn collections(&self) -> impl Iterator<Item = &CollectionStatus> {
        self.collections.values()
    }

    pub fn in_state(&self, state: CollectionState) -> Vec<&CollectionStatus> {
        self.collections
            .values()
            .filter(|s| s.state == state)
            .collect()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
