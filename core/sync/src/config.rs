//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use tidesync_common::{CollectionName, Error, Result};

use crate::retry::RetryConfig;

/// Serialize a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Configuration for a sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Collections to pull change streams for.
    pub collections: Vec<CollectionName>,
    /// Mutations taken from the outbox per drain cycle.
    pub batch_size: usize,
    /// Entities committed in parallel within a drain cycle.
    pub max_parallel_entities: usize,
    /// Deltas requested per pull poll.
    pub pull_batch_size: usize,
    /// Pause between drain cycles when the outbox is idle.
    #[serde(rename = "drain_interval_ms", with = "duration_ms")]
    pub drain_interval: Duration,
    /// Age of the oldest pending mutation that triggers a degraded advisory.
    #[serde(rename = "staleness_threshold_ms", with = "duration_ms")]
    pub staleness_threshold: Duration,
    /// Maximum open mutations held by the outbox.
    pub outbox_capacity: usize,
    /// Backoff while the remote store is unreachable.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Config subscribing to the given collections, defaults otherwise.
    pub fn for_collections<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let collections = names
            .into_iter()
            .map(CollectionName::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            collections,
            ..Self::default()
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    /// Check that the values can drive an engine.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.pull_batch_size == 0 {
            return Err(Error::InvalidInput(
                "Batch sizes must be positive".to_string(),
            ));
        }
        if self.max_parallel_entities == 0 {
            return Err(Error::InvalidInput(
                "max_parallel_entities must be positive".to_string(),
            ));
        }
        if self.outbox_capacity == 0 {
            return Err(Error::InvalidInput(
                "outbox_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Saved sync config to {:?}", path);
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            batch_size: 50,
            max_parallel_entities: 8,
            pull_batch_size: 200,
            drain_interval: Duration::from_secs(2),
            staleness_threshold: Duration::from_secs(300),
            outbox_capacity: tidesync_store::DEFAULT_CAPACITY,
            retry: RetryConfig::new(5)
                .with_initial_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(60)),
        }
    }
}
