//! Handshake session orchestration.
//!
//! ## Protocol Flow
//!
//! 1. Sender calls [`HandshakeSession::create`]: a uniquely named slot is
//!    branched off the default branch head, a token is signed with a
//!    throwaway key, and the unlocked record is written.
//! 2. Sender hands the token to the receiver out of band.
//! 3. Receiver calls [`HandshakeSession::check`]: the session id is read
//!    from the token, the record is locked, the policy gates run, and the
//!    record is written back unlocked (with one use consumed on success).
//! 4. Sender calls [`HandshakeSession::cleanup`] to delete the slot.
//!
//! ```ignore
//! let session = HandshakeSession::new(store, HandshakeConfig::default());
//! let created = session.create(CreatePolicy::new("svc-b", 1, 5)).await?;
//! let outcome = session.check(&created.token, "svc-b").await?;
//! assert!(outcome.accepted);
//! session.cleanup(&created.token).await?;
//! ```

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::HandshakeConfig;
use crate::error::{HandshakeError, Result};
use crate::gate::{GateContext, GateVerdict, PolicyGate, Rejection, default_gates, evaluate_gates};
use crate::lock::DistributedLock;
use crate::record::{ConfigRecord, Provenance, ReceiverInfo, RecordStore};
use crate::store::{RemoteObjectStore, StoreError};
use crate::token::{IssueOptions, TokenIssuer, peek_session_id};

/// Lifecycle of a handshake session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Slot allocated, token not yet persisted.
    Created,
    /// Record persisted, waiting for receivers.
    AwaitingCheck,
    /// At least one check ran; holds the latest result.
    Checked(bool),
    /// Slot deleted.
    CleanedUp,
    /// Creation failed after allocation and the slot was rolled back.
    Aborted,
}

impl SessionPhase {
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Created, AwaitingCheck)
                | (Created, Aborted)
                | (AwaitingCheck, Checked(_))
                | (Checked(_), Checked(_))
                | (AwaitingCheck, CleanedUp)
                | (Checked(_), CleanedUp)
                | (CleanedUp, CleanedUp)
        )
    }

    fn advance(self, next: SessionPhase, slot: &str) -> SessionPhase {
        debug_assert!(
            self.can_transition_to(next),
            "illegal session transition {:?} -> {:?}",
            self,
            next
        );
        debug!("Session {}: {:?} -> {:?}", slot, self, next);
        next
    }
}

/// Parameters for a new session.
#[derive(Debug, Clone)]
pub struct CreatePolicy {
    /// Receiver identity allowed to complete the handshake.
    pub destination: String,
    /// How many successful checks the token allows (>= 1).
    pub max_usage_count: u32,
    /// Token lifetime in minutes (> 0).
    pub expiration_minutes: i64,
    /// Optional activation time for the token.
    pub not_before: Option<DateTime<Utc>>,
    /// Who created the session and from which run.
    pub provenance: Provenance,
}

impl CreatePolicy {
    pub fn new(destination: impl Into<String>, max_usage_count: u32, expiration_minutes: i64) -> Self {
        Self {
            destination: destination.into(),
            max_usage_count,
            expiration_minutes,
            not_before: None,
            provenance: Provenance::default(),
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_usage_count < 1 {
            return Err(HandshakeError::InvalidPolicy(
                "max_usage_count must be at least 1".to_string(),
            ));
        }
        if self.expiration_minutes <= 0 {
            return Err(HandshakeError::InvalidPolicy(
                "expiration_minutes must be positive".to_string(),
            ));
        }
        if self.destination.trim().is_empty() {
            return Err(HandshakeError::InvalidPolicy(
                "destination must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of a successful `create`.
#[derive(Clone)]
pub struct CreatedSession {
    /// Signed token to hand to the receiver.
    pub token: String,
    pub session_id: String,
    /// Branch holding the record; keep it for cleanup.
    pub slot: String,
    pub expires_at: DateTime<Utc>,
    pub phase: SessionPhase,
}

impl std::fmt::Debug for CreatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedSession")
            .field("session_id", &self.session_id)
            .field("slot", &self.slot)
            .field("expires_at", &self.expires_at)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Result of a `check`. A rejection is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub accepted: bool,
    pub rejection: Option<Rejection>,
    pub usage_count: u32,
    pub max_usage_count: u32,
    pub phase: SessionPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The slot was deleted. `receivers` is `None` if the audit trail
    /// couldn't be read beforehand.
    Removed { receivers: Option<Vec<ReceiverInfo>> },
    /// The slot was already gone.
    AlreadyRemoved,
}

/// Create / check / cleanup over a remote object store.
pub struct HandshakeSession {
    store: Arc<dyn RemoteObjectStore>,
    records: RecordStore,
    lock: DistributedLock,
    gates: Vec<Box<dyn PolicyGate>>,
    config: HandshakeConfig,
}

impl HandshakeSession {
    pub fn new(store: Arc<dyn RemoteObjectStore>, config: HandshakeConfig) -> Self {
        let records = RecordStore::new(store.clone(), config.record_path.clone(), config.write_retry);
        let lock = DistributedLock::new(records.clone(), config.lock_retry, config.lock_stale_after);
        Self {
            store,
            records,
            lock,
            gates: default_gates(),
            config,
        }
    }

    /// Replace the policy gates evaluated by `check`.
    pub fn with_gates(mut self, gates: Vec<Box<dyn PolicyGate>>) -> Self {
        self.gates = gates;
        self
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Branch name for a token, without touching the store.
    pub fn slot_for_token(&self, token: &str) -> Result<String> {
        let session_id =
            peek_session_id(token).map_err(|e| HandshakeError::MalformedToken(e.to_string()))?;
        Ok(self.config.slot_name(&session_id))
    }

    /// Open a new session.
    ///
    /// Any failure after the slot exists deletes it again before returning
    /// [`HandshakeError::PartialFailureDuringCreate`].
    pub async fn create(&self, policy: CreatePolicy) -> Result<CreatedSession> {
        policy.validate()?;

        let head = self.store.default_head().await?;
        let (session_id, slot) = self.allocate_slot(&head).await?;
        let phase = SessionPhase::Created;

        match self.initialize(&slot, &session_id, &policy).await {
            Ok(issued) => {
                let phase = phase.advance(SessionPhase::AwaitingCheck, &slot);
                info!("Prepared for handshake in {}", slot);
                Ok(CreatedSession {
                    token: issued.token,
                    session_id,
                    slot,
                    expires_at: issued.expires_at,
                    phase,
                })
            }
            Err(e) => {
                error!("Couldn't prepare handshake in {}: {}", slot, e);
                phase.advance(SessionPhase::Aborted, &slot);
                self.rollback(&slot).await;
                Err(HandshakeError::PartialFailureDuringCreate {
                    slot,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn allocate_slot(&self, head: &str) -> Result<(String, String)> {
        for _ in 0..self.config.max_slot_attempts.max(1) {
            let session_id = random_session_id(self.config.session_id_len);
            let slot = self.config.slot_name(&session_id);
            match self.store.create_ref(&slot, head).await {
                Ok(()) => {
                    debug!("Allocated slot {}", slot);
                    return Ok((session_id, slot));
                }
                Err(StoreError::Conflict(_)) => {
                    debug!("Slot {} already exists, regenerating", slot);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(HandshakeError::SlotAllocationExhausted(
            self.config.max_slot_attempts.max(1),
        ))
    }

    async fn initialize(
        &self,
        slot: &str,
        session_id: &str,
        policy: &CreatePolicy,
    ) -> Result<crate::token::IssuedToken> {
        let mut options = IssueOptions::expiring_in(policy.expiration_minutes);
        if let Some(at) = policy.not_before {
            options = options.not_before(at);
        }
        let issued = TokenIssuer::issue_with(session_id, options)?;

        let record = ConfigRecord::new(
            issued.public_key.clone(),
            policy.destination.clone(),
            policy.max_usage_count,
            policy.provenance.clone(),
        );
        self.records.write(slot, &record, None, "Create config").await?;
        Ok(issued)
    }

    async fn rollback(&self, slot: &str) {
        match self.store.delete_ref(slot).await {
            Ok(()) => info!("Rolled back slot {}", slot),
            Err(e) => error!("Couldn't delete slot {} after failed create: {}", slot, e),
        }
    }

    /// Present `token` as `receiver`.
    ///
    /// Fatal errors are limited to a malformed token, a missing session,
    /// lock timeout or loss, and store/infrastructure failures. Every gate
    /// rejection comes back as `accepted: false`.
    pub async fn check(&self, token: &str, receiver: &str) -> Result<CheckOutcome> {
        let slot = self.slot_for_token(token).inspect_err(|_| {
            warn!("Something is wrong with the token payload");
        })?;

        if !self.records.exists(&slot).await? {
            return Err(HandshakeError::SessionNotFound(slot));
        }

        let gates = &self.gates;
        let outcome = self
            .lock
            .with_lock(&slot, |mut record: ConfigRecord| {
                let verdict = evaluate_gates(
                    gates,
                    &GateContext {
                        record: &record,
                        token,
                        receiver,
                    },
                );
                let result = verdict.map(|verdict| {
                    let rejection = match verdict {
                        GateVerdict::Pass => {
                            record.record_receiver(receiver, Utc::now());
                            None
                        }
                        GateVerdict::Reject(rejection) => Some(rejection),
                    };
                    let outcome = CheckOutcome {
                        accepted: rejection.is_none(),
                        rejection,
                        usage_count: record.usage_count,
                        max_usage_count: record.max_usage_count,
                        phase: SessionPhase::AwaitingCheck,
                    };
                    (record, outcome)
                });
                std::future::ready(result)
            })
            .await?;

        let phase = SessionPhase::AwaitingCheck.advance(SessionPhase::Checked(outcome.accepted), &slot);
        match outcome.rejection {
            None => info!(
                "Handshake is completed by {} ({}/{})",
                receiver, outcome.usage_count, outcome.max_usage_count
            ),
            Some(rejection) => warn!("Handshake failed for {}: {}", receiver, rejection),
        }
        Ok(CheckOutcome { phase, ..outcome })
    }

    /// Tear down the session a token belongs to. Idempotent.
    pub async fn cleanup(&self, token: &str) -> Result<CleanupOutcome> {
        let slot = self.slot_for_token(token)?;
        self.cleanup_slot(&slot).await
    }

    /// Tear down a session by slot name. Idempotent.
    ///
    /// The receiver audit trail is read and logged first on a best-effort
    /// basis. A missing slot is reported as `AlreadyRemoved`; any other
    /// deletion failure is an error.
    pub async fn cleanup_slot(&self, slot: &str) -> Result<CleanupOutcome> {
        let receivers = match self.records.read::<ConfigRecord>(slot).await {
            Ok(current) => {
                let names: Vec<&str> = current
                    .record
                    .receivers
                    .iter()
                    .map(|r| r.receiver_name.as_str())
                    .collect();
                info!(
                    "Session {} used {}/{} times, receivers: {:?}",
                    slot, current.record.usage_count, current.record.max_usage_count, names
                );
                Some(current.record.receivers)
            }
            Err(e) => {
                warn!("Can't get receivers from config in {}: {}", slot, e);
                None
            }
        };

        info!("Cleaning handshake data in {}", slot);
        match self.store.delete_ref(slot).await {
            Ok(()) => {
                SessionPhase::AwaitingCheck.advance(SessionPhase::CleanedUp, slot);
                info!("Handshake data in {} cleaned", slot);
                Ok(CleanupOutcome::Removed { receivers })
            }
            Err(StoreError::NotFound(_)) => {
                SessionPhase::CleanedUp.advance(SessionPhase::CleanedUp, slot);
                warn!("Handshake data in {} was already cleaned or not found", slot);
                Ok(CleanupOutcome::AlreadyRemoved)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn random_session_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len.max(1))
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use SessionPhase::*;
        assert!(Created.can_transition_to(AwaitingCheck));
        assert!(Created.can_transition_to(Aborted));
        assert!(AwaitingCheck.can_transition_to(Checked(true)));
        assert!(Checked(false).can_transition_to(Checked(true)));
        assert!(Checked(true).can_transition_to(CleanedUp));
        assert!(CleanedUp.can_transition_to(CleanedUp));

        assert!(!Aborted.can_transition_to(AwaitingCheck));
        assert!(!CleanedUp.can_transition_to(Checked(true)));
        assert!(!Created.can_transition_to(Checked(true)));
    }

    #[test]
    fn test_policy_validation() {
        assert!(CreatePolicy::new("svc-b", 1, 5).validate().is_ok());
        assert!(matches!(
            CreatePolicy::new("svc-b", 0, 5).validate(),
            Err(HandshakeError::InvalidPolicy(_))
        ));
        assert!(matches!(
            CreatePolicy::new("svc-b", 1, 0).validate(),
            Err(HandshakeError::InvalidPolicy(_))
        ));
        assert!(matches!(
            CreatePolicy::new("  ", 1, 5).validate(),
            Err(HandshakeError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_random_session_id_shape() {
        let id = random_session_id(10);
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
