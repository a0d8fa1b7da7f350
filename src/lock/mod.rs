//! Lease-based global lock
//!
//! One named record guards the shared Grafana state. A holder writes the
//! record with an expiry; anyone may overwrite it once that expiry has
//! passed, so an invocation killed mid-hold blocks others for at most the
//! lease it declared.
//!
//! Staleness is judged with the caller's clock against the stored expiry.
//! There is no fencing token: clock skew between environments directly
//! widens or narrows the exclusion window.

#[cfg(feature = "cloud")]
mod dynamodb;
mod memory;

#[cfg(feature = "cloud")]
pub(crate) use dynamodb::classify_sdk_error;
#[cfg(feature = "cloud")]
pub use dynamodb::DynamoLockStore;
pub use memory::MemoryLockStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::SharedClock;
use crate::error::{GrafanaLambdaError, Result};

/// Stored lock row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub id: String,
    /// Epoch seconds after which the record no longer excludes anyone
    pub expire_at: i64,
}

impl LockRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expire_at
    }
}

/// Backend holding the lock record
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Write `record` only if no record exists for its id, or the existing
    /// one expired before `now`. Fails with `ConditionFailed` otherwise.
    async fn put_if_vacant(&self, record: &LockRecord, now: i64) -> Result<()>;

    /// Remove the record unconditionally
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Polling and retry knobs
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Wait between attempts while another holder is live
    pub contention_backoff: Duration,
    /// Wait after the store reports throttling
    pub throttle_backoff: Duration,
    /// Retries allowed for a failing release
    pub release_attempts: u32,
    pub release_backoff: Duration,
    /// Upper bound on acquire polling; `None` polls until the caller dies
    pub max_wait: Option<Duration>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            contention_backoff: Duration::from_millis(100),
            throttle_backoff: Duration::from_millis(200),
            release_attempts: 5,
            release_backoff: Duration::from_millis(200),
            max_wait: None,
        }
    }
}

/// Handle on the single lock domain
pub struct LeaseLock {
    store: Arc<dyn LockStore>,
    clock: SharedClock,
    lock_id: String,
    settings: LockSettings,
    held: bool,
}

impl LeaseLock {
    pub fn new(
        store: Arc<dyn LockStore>,
        clock: SharedClock,
        lock_id: impl Into<String>,
        settings: LockSettings,
    ) -> Self {
        Self {
            store,
            clock,
            lock_id: lock_id.into(),
            settings,
            held: false,
        }
    }

    /// Whether the last acquire succeeded and no release followed
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Block until the lock is ours for `lease`, bounded by the configured `max_wait`
    pub async fn acquire(&mut self, lease: Duration) -> Result<LockRecord> {
        self.acquire_within(lease, self.settings.max_wait).await
    }

    /// Block until the lock is ours for `lease`, giving up after `max_wait`
    pub async fn acquire_within(
        &mut self,
        lease: Duration,
        max_wait: Option<Duration>,
    ) -> Result<LockRecord> {
        let started = self.clock.now();
        let lease_secs = lease.as_secs() as i64 + i64::from(lease.subsec_nanos() > 0);

        loop {
            let now = self.clock.epoch_seconds();
            let record = LockRecord {
                id: self.lock_id.clone(),
                expire_at: now + lease_secs,
            };

            tracing::debug!(
                lock_id = %self.lock_id,
                expire_at = record.expire_at,
                "Acquiring lock"
            );
            let backoff = match self.store.put_if_vacant(&record, now).await {
                Ok(()) => {
                    tracing::info!(
                        lock_id = %self.lock_id,
                        expire_at = record.expire_at,
                        "Lock acquired"
                    );
                    self.held = true;
                    return Ok(record);
                }
                Err(GrafanaLambdaError::ConditionFailed(_)) => {
                    tracing::debug!(lock_id = %self.lock_id, "Waiting for lock");
                    self.settings.contention_backoff
                }
                Err(GrafanaLambdaError::StoreThrottled(msg)) => {
                    tracing::warn!(lock_id = %self.lock_id, "Waiting for throttle: {}", msg);
                    self.settings.throttle_backoff
                }
                Err(e) => return Err(e),
            };

            if let Some(limit) = max_wait {
                let waited = (self.clock.now() - started).to_std().unwrap_or_default();
                if waited + backoff > limit {
                    return Err(GrafanaLambdaError::LockTimeout(limit));
                }
            }

            self.clock.sleep(backoff).await;
        }
    }

    /// Delete the record, retrying a bounded number of times
    pub async fn release(&mut self) -> Result<()> {
        let mut retries_left = self.settings.release_attempts;

        loop {
            tracing::debug!(lock_id = %self.lock_id, "Releasing lock");
            match self.store.delete(&self.lock_id).await {
                Ok(()) => {
                    tracing::info!(lock_id = %self.lock_id, "Lock released");
                    self.held = false;
                    return Ok(());
                }
                Err(e) if retries_left > 0 => {
                    tracing::warn!(
                        lock_id = %self.lock_id,
                        retries_left,
                        "Lock release failed, retrying: {}",
                        e
                    );
                    retries_left -= 1;
                    self.clock.sleep(self.settings.release_backoff).await;
                }
                Err(e) => {
                    tracing::error!(lock_id = %self.lock_id, "Lock release failed: {}", e);
                    return Err(e);
                }
            }
        }
    }
}
