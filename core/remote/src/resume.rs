//! Change streams that reconnect on transient loss.
//!
//! A resumable stream remembers the cursor of the last batch it yielded
//! and, when the underlying connection drops or the server closes it,
//! re-subscribes from there after a backoff delay. Only a broken cursor, a non-transient error or
//! exhausted reconnect attempts end it.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tidesync_common::{CollectionName, Error, RemoteError, ResumeToken};

use crate::gateway::{DeltaStream, RemoteGateway};

/// How a resumable stream waits between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

/// Exponential backoff: `initial * multiplier^attempt`, capped at `max`,
/// optionally spread by +/-25% jitter. Rounded to whole milliseconds.
pub fn backoff_delay(
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    attempt: u32,
) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let grown = initial.as_millis() as f64 * multiplier.powi(exponent);
    let mut millis = grown.min(max.as_millis() as f64);
    if jitter {
        millis *= 0.75 + rand::random::<f64>() * 0.5;
    }
    Duration::from_millis(millis.max(0.0).round() as u64)
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_delay,
            self.max_delay,
            self.multiplier,
            self.jitter,
            attempt,
        )
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Remote(remote) if remote.is_transient())
}

struct Resume {
    gateway: Arc<dyn RemoteGateway>,
    collection: CollectionName,
    cursor: Option<ResumeToken>,
    policy: ReconnectPolicy,
    inner: Option<DeltaStream>,
    failures: u32,
    done: bool,
}

impl Resume {
    /// Back off after a transient failure or a closed stream. Returns
    /// `false` once the policy gives up.
    async fn back_off(&mut self, reason: &str) -> bool {
        if let Some(max) = self.policy.max_attempts {
            if self.failures >= max {
                warn!(
                    "Giving up on {} stream after {} attempts: {}",
                    self.collection, self.failures, reason
                );
                return false;
            }
        }
        let delay = self.policy.delay_for_attempt(self.failures);
        self.failures += 1;
        debug!(
            "Stream for {} lost ({}), reconnecting in {:?}",
            self.collection, reason, delay
        );
        tokio::time::sleep(delay).await;
        true
    }
}

/// Open a delta stream that survives transient disconnects.
///
/// Replays from the last yielded cursor after each reconnect. Yields the
/// final error before ending when it cannot continue.
pub fn resumable(
    gateway: Arc<dyn RemoteGateway>,
    collection: CollectionName,
    cursor: Option<ResumeToken>,
    policy: ReconnectPolicy,
) -> DeltaStream {
    let state = Resume {
        gateway,
        collection,
        cursor,
        policy,
        inner: None,
        failures: 0,
        done: false,
    };
    Box::pin(futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            let next = match st.inner.as_mut() {
                Some(inner) => inner.next().await,
                None => {
                    match st.gateway.subscribe(&st.collection, st.cursor.clone()).await {
                        Ok(inner) => {
                            st.inner = Some(inner);
                            continue;
                        }
                        Err(e) => Some(Err(e)),
                    }
                }
            };
            match next {
                Some(Ok(batch)) => {
                    st.failures = 0;
                    st.cursor = Some(batch.cursor.clone());
                    return Some((Ok(batch), st));
                }
                Some(Err(e)) if is_transient(&e) => {
                    st.inner = None;
                    if !st.back_off(&e.to_string()).await {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
                None => {
                    // Server closed the stream; resume from the cursor once
                    // the backoff allows. Only a delivered batch resets it.
                    st.inner = None;
                    if !st.back_off("closed by server").await {
                        st.done = true;
                        let e = RemoteError::Unreachable(format!(
                            "{} stream kept closing",
                            st.collection
                        ));
                        return Some((Err(Error::Remote(e)), st));
                    }
                }
            }
        }
    }))
}
