//! GitHub-backed handshake sessions.
//!
//! Wires [`GitHubStore`] into a [`HandshakeSession`] using settings taken
//! from the Actions environment:
//!
//! ```ignore
//! let settings = GitHubSettings::from_env()?;
//! let session = ztshake_github::connect(&settings)?;
//! let created = session
//!     .create(CreatePolicy::new("svc-b", 1, 5).with_provenance(provenance_from_env()))
//!     .await?;
//! ```

use std::sync::Arc;

use ztshake_core::{HandshakeSession, StoreError};

pub mod config;
pub mod store;

pub use config::{GitHubSettings, SettingsError, provenance_from_env};
pub use store::GitHubStore;

/// Build a session over the repository named in `settings`.
pub fn connect(settings: &GitHubSettings) -> Result<HandshakeSession, StoreError> {
    let store = Arc::new(GitHubStore::new(settings)?);
    Ok(HandshakeSession::new(store, settings.handshake_config()))
}
