//! Advisory distributed lock over a record in the object store.
//!
//! There is no lock service. The lock token lives inside the record it
//! guards and is taken with the store's compare-and-swap write:
//!
//! 1. read the record and its version tag
//! 2. bail out if it is already locked (and not stale)
//! 3. write it back with a fresh lock token, conditional on that version tag
//!
//! A lost compare-and-swap is an acquisition failure, never an overwrite.
//! [`DistributedLock::with_lock`] is the only way the session code enters a
//! critical section; it releases the lock on every exit path, including
//! errors and panics.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{HandshakeError, Result};
use crate::record::{RecordStore, Versioned};
use crate::retry::RetryPolicy;
use crate::store::VersionTag;

/// Lock token embedded in a guarded record.
///
/// Serialized flat into the record, so the persisted JSON carries a plain
/// `locked` flag plus optional holder metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
}

impl LockState {
    pub fn acquire(&mut self, holder: String, now: DateTime<Utc>) {
        self.locked = true;
        self.lock_holder = Some(holder);
        self.locked_at = Some(now);
    }

    pub fn release(&mut self) {
        self.locked = false;
        self.lock_holder = None;
        self.locked_at = None;
    }

    /// Whether the lock is currently held by `holder`.
    pub fn is_held_by(&self, holder: &str) -> bool {
        self.locked && self.lock_holder.as_deref() == Some(holder)
    }

    /// Whether a held lock is older than `window`.
    ///
    /// A lock without a timestamp is never considered stale.
    pub fn is_stale(&self, now: DateTime<Utc>, window: Option<Duration>) -> bool {
        let (Some(window), Some(locked_at)) = (window, self.locked_at) else {
            return false;
        };
        if !self.locked {
            return false;
        }
        match chrono::Duration::from_std(window) {
            Ok(window) => now.signed_duration_since(locked_at) > window,
            Err(_) => false,
        }
    }
}

/// A record that carries its own lock token.
pub trait Lockable: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn lock_state(&self) -> &LockState;
    fn lock_state_mut(&mut self) -> &mut LockState;
}

/// Proof of a successful acquisition.
#[derive(Debug, Clone)]
pub struct LockGrant<R> {
    /// The record as written by the lock acquisition.
    pub record: R,
    /// Version tag of that write.
    pub version: VersionTag,
    /// Random token identifying this holder.
    pub holder: String,
}

#[derive(Clone)]
pub struct DistributedLock {
    records: RecordStore,
    retry: RetryPolicy,
    stale_after: Option<Duration>,
}

impl DistributedLock {
    pub fn new(records: RecordStore, retry: RetryPolicy, stale_after: Option<Duration>) -> Self {
        Self {
            records,
            retry,
            stale_after,
        }
    }

    /// One acquisition attempt. `Ok(None)` means someone else holds the lock
    /// or won the race; the record is left untouched.
    pub async fn try_acquire<R: Lockable>(&self, slot: &str) -> Result<Option<LockGrant<R>>> {
        let current = self.records.read::<R>(slot).await?;
        let mut record = current.record;
        let now = Utc::now();

        if record.lock_state().locked {
            if !record.lock_state().is_stale(now, self.stale_after) {
                info!("Config in {} already locked", slot);
                return Ok(None);
            }
            warn!(
                "Reclaiming stale lock on {} held by {} since {:?}",
                slot,
                record.lock_state().lock_holder.as_deref().unwrap_or("unknown"),
                record.lock_state().locked_at
            );
        }

        let holder = new_holder_token();
        record.lock_state_mut().acquire(holder.clone(), now);

        match self
            .records
            .try_replace(slot, &record, &current.version, "Lock config")
            .await?
        {
            Some(version) => {
                info!("Config in {} locked", slot);
                Ok(Some(LockGrant {
                    record,
                    version,
                    holder,
                }))
            }
            None => {
                info!("Couldn't lock config in {}: concurrent writer won", slot);
                Ok(None)
            }
        }
    }

    /// Acquire with the configured retry policy.
    ///
    /// Exhausting the policy returns [`HandshakeError::LockTimeout`].
    pub async fn acquire<R: Lockable>(&self, slot: &str) -> Result<LockGrant<R>> {
        let attempts = self.retry.attempts();
        for attempt in 1..=attempts {
            debug!("Trying to lock config in {} ({}/{})", slot, attempt, attempts);
            if let Some(grant) = self.try_acquire(slot).await? {
                return Ok(grant);
            }
            if self.retry.should_retry(attempt) {
                self.retry.wait().await;
            }
        }
        Err(HandshakeError::LockTimeout {
            slot: slot.to_string(),
            attempts,
        })
    }

    /// Write `record` back with the lock cleared, as long as `holder` still
    /// owns the lock.
    ///
    /// The write is conditional on `version`. A lost race is re-read: if the
    /// lock is still ours the write is retried against the fresh tag
    /// (bounded by the record store's write policy), otherwise the record
    /// is left alone and [`HandshakeError::LockLost`] is returned.
    pub async fn release<R: Lockable>(
        &self,
        slot: &str,
        mut record: R,
        holder: &str,
        version: VersionTag,
    ) -> Result<VersionTag> {
        record.lock_state_mut().release();
        let policy = self.records.write_retry();
        let mut expected = version;
        let mut attempt = 1;

        loop {
            if let Some(version) = self
                .records
                .try_replace(slot, &record, &expected, "Unlock config")
                .await?
            {
                info!("Config in {} unlocked", slot);
                return Ok(version);
            }

            let current = self.records.read::<R>(slot).await?;
            if !current.record.lock_state().is_held_by(holder) {
                warn!(
                    "Lock on {} was taken over by {}, discarding our update",
                    slot,
                    current
                        .record
                        .lock_state()
                        .lock_holder
                        .as_deref()
                        .unwrap_or("nobody")
                );
                return Err(HandshakeError::LockLost {
                    slot: slot.to_string(),
                });
            }
            if !policy.should_retry(attempt) {
                return Err(HandshakeError::VersionConflict {
                    slot: slot.to_string(),
                    attempts: attempt,
                });
            }
            info!("Version expired for {}, retrying unlock...", slot);
            policy.wait().await;
            expected = current.version;
            attempt += 1;
        }
    }

    /// Best-effort unlock after a failed critical section.
    ///
    /// Re-reads the latest record so a mutation that already landed is not
    /// rolled back; falls back to `last_seen` if the read fails. A lock that
    /// now belongs to someone else is never cleared. Errors are logged and
    /// swallowed.
    pub async fn emergency_unlock<R: Lockable>(
        &self,
        slot: &str,
        holder: &str,
        last_seen: Versioned<R>,
    ) {
        let current = match self.records.read::<R>(slot).await {
            Ok(latest) => {
                if !latest.record.lock_state().is_held_by(holder) {
                    warn!("Lock on {} is no longer ours, skipping emergency unlock", slot);
                    return;
                }
                latest
            }
            Err(e) => {
                warn!("Couldn't re-read config in {} for emergency unlock: {}", slot, e);
                last_seen
            }
        };
        if let Err(e) = self.release(slot, current.record, holder, current.version).await {
            error!("Couldn't make emergency unlock of {}: {}", slot, e);
        }
    }

    /// Run `critical` while holding the lock on `slot`.
    ///
    /// The closure receives the freshly re-read record and returns it
    /// (possibly mutated) together with its result; the returned record is
    /// written back unlocked. If the closure fails or panics, or the final
    /// write fails, the emergency unlock runs before the error (or panic)
    /// propagates. If the lock was reclaimed while the closure ran, its
    /// record is discarded and [`HandshakeError::LockLost`] is returned.
    pub async fn with_lock<R, T, F, Fut>(&self, slot: &str, critical: F) -> Result<T>
    where
        R: Lockable,
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<(R, T)>>,
    {
        let grant: LockGrant<R> = self.acquire(slot).await?;
        let holder = grant.holder;
        debug!("Holding lock {} on {}", holder, slot);

        let latest = match self.records.read::<R>(slot).await {
            Ok(latest) => latest,
            Err(e) => {
                let last_seen = Versioned {
                    record: grant.record,
                    version: grant.version,
                };
                self.emergency_unlock(slot, &holder, last_seen).await;
                return Err(e);
            }
        };
        if !latest.record.lock_state().is_held_by(&holder) {
            warn!("Lock on {} was taken over before the critical section", slot);
            return Err(HandshakeError::LockLost {
                slot: slot.to_string(),
            });
        }
        let fallback = latest.clone();
        let version = latest.version;
        let input = latest.record;

        // Calling the closure inside the future keeps synchronous panics catchable.
        let outcome = AssertUnwindSafe(async move { critical(input).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok((record, value))) => match self.release(slot, record, &holder, version).await {
                Ok(_) => Ok(value),
                Err(e @ HandshakeError::LockLost { .. }) => Err(e),
                Err(e) => {
                    error!("Couldn't write config in {}: {}", slot, e);
                    self.emergency_unlock(slot, &holder, fallback).await;
                    Err(e)
                }
            },
            Ok(Err(e)) => {
                self.emergency_unlock(slot, &holder, fallback).await;
                Err(e)
            }
            Err(panic) => {
                error!("Critical section on {} panicked, unlocking", slot);
                self.emergency_unlock(slot, &holder, fallback).await;
                std::panic::resume_unwind(panic)
            }
        }
    }
}

fn new_holder_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
