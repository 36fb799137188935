//! Persisted session state and its typed store.
//!
//! A session's [`ConfigRecord`] is a single pretty-printed JSON file at a
//! fixed path inside the session's own branch. [`RecordStore`] reads and
//! writes any serde record at that path, retrying the physical write when
//! it loses a compare-and-swap race.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{HandshakeError, Result};
use crate::lock::{LockState, Lockable};
use crate::retry::RetryPolicy;
use crate::store::{RemoteObjectStore, StoreError, VersionTag};

/// One successful check, appended to the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverInfo {
    pub receiver_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Where and by whom a session was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub created_by: String,
    pub run_id: u64,
    pub run_url: String,
}

/// Persisted state of one handshake session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Verification key (SPKI PEM).
    pub public_key: String,
    /// Receiver identity allowed to complete the handshake.
    pub destination: String,
    #[serde(flatten)]
    pub lock: LockState,
    pub usage_count: u32,
    pub max_usage_count: u32,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub run_id: u64,
    pub run_url: String,
    #[serde(default)]
    pub receivers: Vec<ReceiverInfo>,
}

impl ConfigRecord {
    /// Fresh, unlocked record with no uses consumed.
    pub fn new(
        public_key: String,
        destination: String,
        max_usage_count: u32,
        provenance: Provenance,
    ) -> Self {
        Self {
            public_key,
            destination,
            lock: LockState::default(),
            usage_count: 0,
            max_usage_count,
            created_at: Utc::now(),
            created_by: provenance.created_by,
            run_id: provenance.run_id,
            run_url: provenance.run_url,
            receivers: Vec::new(),
        }
    }

    pub fn remaining_uses(&self) -> u32 {
        self.max_usage_count.saturating_sub(self.usage_count)
    }

    pub fn is_exhausted(&self) -> bool {
        self.usage_count >= self.max_usage_count
    }

    /// Consume one use and append the receiver to the audit trail.
    pub fn record_receiver(&mut self, receiver_name: &str, timestamp: DateTime<Utc>) {
        self.usage_count += 1;
        self.receivers.push(ReceiverInfo {
            receiver_name: receiver_name.to_string(),
            timestamp,
        });
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Lockable for ConfigRecord {
    fn lock_state(&self) -> &LockState {
        &self.lock
    }

    fn lock_state_mut(&mut self) -> &mut LockState {
        &mut self.lock
    }
}

/// A record together with the version tag it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<R> {
    pub record: R,
    pub version: VersionTag,
}

/// Typed access to the record file inside a slot.
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn RemoteObjectStore>,
    path: String,
    write_retry: RetryPolicy,
}

impl RecordStore {
    pub fn new(
        store: Arc<dyn RemoteObjectStore>,
        path: impl Into<String>,
        write_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            path: path.into(),
            write_retry,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn object_store(&self) -> &Arc<dyn RemoteObjectStore> {
        &self.store
    }

    pub fn write_retry(&self) -> RetryPolicy {
        self.write_retry
    }

    /// Read the record and its version. `SessionNotFound` if slot or file is absent.
    pub async fn read<R: DeserializeOwned>(&self, slot: &str) -> Result<Versioned<R>> {
        let blob = self
            .store
            .get_blob(slot, &self.path)
            .await
            .map_err(|e| not_found_as_session(slot, e))?;
        let record = serde_json::from_slice(&blob.content)?;
        Ok(Versioned {
            record,
            version: blob.version,
        })
    }

    /// Whether both the slot and its record file exist.
    pub async fn exists(&self, slot: &str) -> Result<bool> {
        match self.store.get_blob(slot, &self.path).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Single compare-and-swap attempt against `expected`.
    ///
    /// Returns `None` when a concurrent writer got there first; the record
    /// is never written in that case.
    pub async fn try_replace<R: Serialize>(
        &self,
        slot: &str,
        record: &R,
        expected: &VersionTag,
        message: &str,
    ) -> Result<Option<VersionTag>> {
        let bytes = serde_json::to_vec_pretty(record)?;
        match self
            .store
            .put_blob(slot, &self.path, &bytes, Some(expected), message)
            .await
        {
            Ok(version) => Ok(Some(version)),
            Err(StoreError::Conflict(reason)) => {
                debug!("Compare-and-swap on {} lost: {}", slot, reason);
                Ok(None)
            }
            Err(e) => Err(not_found_as_session(slot, e)),
        }
    }

    /// Write the record, creating it when `expected` is `None`.
    ///
    /// On a version conflict the latest tag is re-read and the write is
    /// retried according to the write retry policy, so this always ends up
    /// overwriting whatever is there. Exhausting the policy surfaces
    /// [`HandshakeError::VersionConflict`].
    pub async fn write<R: Serialize>(
        &self,
        slot: &str,
        record: &R,
        expected: Option<VersionTag>,
        message: &str,
    ) -> Result<VersionTag> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let mut expected = expected;
        let mut attempt = 1;

        loop {
            match self
                .store
                .put_blob(slot, &self.path, &bytes, expected.as_ref(), message)
                .await
            {
                Ok(version) => {
                    info!(
                        "Config {} in {}",
                        if expected.is_some() { "updated" } else { "created" },
                        slot
                    );
                    return Ok(version);
                }
                Err(StoreError::Conflict(reason)) if self.write_retry.should_retry(attempt) => {
                    info!("Version expired for {} ({}), retrying...", slot, reason);
                    self.write_retry.wait().await;
                    expected = self.current_version(slot).await?;
                    attempt += 1;
                }
                Err(StoreError::Conflict(_)) => {
                    return Err(HandshakeError::VersionConflict {
                        slot: slot.to_string(),
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(not_found_as_session(slot, e)),
            }
        }
    }

    async fn current_version(&self, slot: &str) -> Result<Option<VersionTag>> {
        match self.store.get_blob(slot, &self.path).await {
            Ok(blob) => Ok(Some(blob.version)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn not_found_as_session(slot: &str, e: StoreError) -> HandshakeError {
    match e {
        StoreError::NotFound(_) => HandshakeError::SessionNotFound(slot.to_string()),
        other => HandshakeError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryObjectStore;
    use std::time::Duration;

    fn sample_record() -> ConfigRecord {
        ConfigRecord::new(
            "-----BEGIN PUBLIC KEY-----\nMCo=\n-----END PUBLIC KEY-----\n".to_string(),
            "svc-b".to_string(),
            3,
            Provenance {
                created_by: "octocat".to_string(),
                run_id: 42,
                run_url: "https://github.com/o/r/actions/runs/42".to_string(),
            },
        )
    }

    async fn setup() -> (Arc<InMemoryObjectStore>, RecordStore) {
        let store = Arc::new(InMemoryObjectStore::new());
        let head = store.default_head().await.unwrap();
        store.create_ref("slot", &head).await.unwrap();
        let records = RecordStore::new(
            store.clone(),
            "config.json",
            RetryPolicy::new(3, Duration::ZERO),
        );
        (store, records)
    }

    #[test]
    fn test_json_uses_flat_lock_field() {
        let record = sample_record();
        let json: serde_json::Value = serde_json::from_slice(&record.to_json().unwrap()).unwrap();
        assert_eq!(json["locked"], serde_json::Value::Bool(false));
        assert!(json.get("lock").is_none());
        assert!(json.get("lock_holder").is_none());
        assert_eq!(json["usage_count"], 0);
        assert_eq!(json["receivers"], serde_json::json!([]));
    }

    #[test]
    fn test_reads_record_without_lock_metadata() {
        let json = r#"{
          "public_key": "pk",
          "destination": "svc-b",
          "locked": true,
          "usage_count": 1,
          "max_usage_count": 2,
          "created_at": "2024-05-01T10:00:00.000Z",
          "created_by": "octocat",
          "run_id": 7,
          "run_url": "https://github.com/o/r/actions/runs/7",
          "receivers": []
        }"#;
        let record = ConfigRecord::from_json(json.as_bytes()).unwrap();
        assert!(record.lock.locked);
        assert!(record.lock.locked_at.is_none());
        assert_eq!(record.remaining_uses(), 1);
    }

    #[test]
    fn test_record_receiver_consumes_a_use() {
        let mut record = sample_record();
        record.record_receiver("svc-b", Utc::now());
        assert_eq!(record.usage_count, 1);
        assert_eq!(record.receivers.len(), 1);
        assert_eq!(record.receivers[0].receiver_name, "svc-b");
        assert!(!record.is_exhausted());
    }

    #[tokio::test]
    async fn test_round_trip_through_store() {
        let (_store, records) = setup().await;
        let record = sample_record();
        records.write("slot", &record, None, "Create config").await.unwrap();

        let read: Versioned<ConfigRecord> = records.read("slot").await.unwrap();
        assert_eq!(read.record, record);
    }

    #[tokio::test]
    async fn test_read_missing_is_session_not_found() {
        let (_store, records) = setup().await;
        let err = records.read::<ConfigRecord>("slot").await.unwrap_err();
        assert!(matches!(err, HandshakeError::SessionNotFound(_)));
        assert!(!records.exists("slot").await.unwrap());
        assert!(!records.exists("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_retries_with_latest_version() {
        let (_store, records) = setup().await;
        let mut record = sample_record();
        let stale = records.write("slot", &record, None, "Create config").await.unwrap();

        record.usage_count = 1;
        records
            .write("slot", &record, Some(stale.clone()), "Update config")
            .await
            .unwrap();

        // Still holding the first tag: the write re-reads and lands anyway.
        record.usage_count = 2;
        records
            .write("slot", &record, Some(stale), "Update config")
            .await
            .unwrap();

        let read: Versioned<ConfigRecord> = records.read("slot").await.unwrap();
        assert_eq!(read.record.usage_count, 2);
    }

    #[tokio::test]
    async fn test_try_replace_reports_lost_race() {
        let (_store, records) = setup().await;
        let record = sample_record();
        let v1 = records.write("slot", &record, None, "Create config").await.unwrap();
        records
            .write("slot", &record, Some(v1.clone()), "Update config")
            .await
            .unwrap();

        let outcome = records
            .try_replace("slot", &record, &v1, "Lock config")
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
