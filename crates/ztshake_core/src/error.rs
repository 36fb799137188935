//! Error types for handshake sessions.
//!
//! Only fatal conditions live here. Routine rejections (expired token,
//! wrong destination, exhausted budget, ...) are reported through
//! [`Rejection`](crate::gate::Rejection) inside a check outcome instead.

use thiserror::Error;

use crate::store::StoreError;
use crate::token::TokenError;

/// Fatal errors surfaced at the session boundary.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The token could not be decoded into a session identifier.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// The session's slot or record does not exist.
    #[error("Handshake session not found: {0}")]
    SessionNotFound(String),

    /// The distributed lock could not be acquired within the retry budget.
    #[error("Couldn't lock config in {slot} after {attempts} attempts")]
    LockTimeout { slot: String, attempts: u32 },

    /// The lock was reclaimed by another holder before it was released.
    ///
    /// The critical section's update was discarded.
    #[error("Lock on {slot} was taken over before release")]
    LockLost { slot: String },

    /// A record write kept losing compare-and-swap races.
    #[error("Version conflict writing {slot} after {attempts} attempts")]
    VersionConflict { slot: String, attempts: u32 },

    /// Every generated slot name collided with an existing one.
    #[error("Couldn't allocate a unique slot after {0} attempts")]
    SlotAllocationExhausted(u32),

    /// Session creation failed after its slot was allocated.
    ///
    /// The slot has been deleted (or deletion was attempted) by the time
    /// this error is returned.
    #[error("Session creation failed after allocating {slot}: {source}")]
    PartialFailureDuringCreate {
        slot: String,
        #[source]
        source: Box<HandshakeError>,
    },

    /// The creation policy is out of range.
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandshakeError {
    /// True when the remote store itself failed (network, auth, 5xx).
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, HandshakeError::Store(StoreError::Unavailable(_)))
    }
}

pub type Result<T> = std::result::Result<T, HandshakeError>;
