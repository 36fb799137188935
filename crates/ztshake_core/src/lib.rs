//! # ztshake
//!
//! Zero-trust handshake between two automated workflows that share nothing
//! but a version-controlled object store.
//!
//! This crate provides:
//! - **Store seam**: [`RemoteObjectStore`] trait and an in-memory implementation
//! - **Records**: the persisted [`ConfigRecord`] and its typed [`RecordStore`]
//! - **Locking**: [`DistributedLock`], an advisory lock built on compare-and-swap writes
//! - **Tokens**: ephemeral-key [`TokenIssuer`] and [`TokenVerifier`]
//! - **Sessions**: the [`HandshakeSession`] create / check / cleanup state machine
//!
//! The GitHub-backed store lives in `ztshake_github`.

pub mod config;
pub mod error;
pub mod gate;
pub mod lock;
pub mod record;
pub mod retry;
pub mod session;
pub mod store;
pub mod token;

pub use config::HandshakeConfig;
pub use error::{HandshakeError, Result};
pub use gate::{PolicyGate, Rejection};
pub use lock::{DistributedLock, LockState, Lockable};
pub use record::{ConfigRecord, Provenance, ReceiverInfo, RecordStore};
pub use retry::RetryPolicy;
pub use session::{
    CheckOutcome, CleanupOutcome, CreatePolicy, CreatedSession, HandshakeSession, SessionPhase,
};
pub use store::{Blob, InMemoryObjectStore, RemoteObjectStore, StoreError, VersionTag};
pub use token::{TokenIssuer, TokenVerifier, Verification};
