use std::time::Duration;

use crate::retry::RetryPolicy;

/// Branch name prefix for session slots.
pub const DEFAULT_SLOT_PREFIX: &str = "tmp_zero_trust_handshake_branch_";

/// Path of the session record inside its slot.
pub const DEFAULT_RECORD_PATH: &str = "tmp_handshake_config_file_123456.json";

/// Tunables for handshake sessions.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Prefix prepended to the session identifier to name its branch.
    pub slot_prefix: String,
    /// Record file path inside each slot.
    pub record_path: String,
    /// Length of generated session identifiers (alphanumeric).
    pub session_id_len: usize,
    /// How many slot names to try before giving up on collisions.
    pub max_slot_attempts: u32,
    /// Lock acquisition polling (default: 5 attempts, 3s apart).
    pub lock_retry: RetryPolicy,
    /// Retries for record writes that lose a version race (default: 10, 1s apart).
    pub write_retry: RetryPolicy,
    /// Locks held longer than this may be reclaimed (default: 10 minutes).
    /// `None` never reclaims.
    pub lock_stale_after: Option<Duration>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            slot_prefix: DEFAULT_SLOT_PREFIX.to_string(),
            record_path: DEFAULT_RECORD_PATH.to_string(),
            session_id_len: 10,
            max_slot_attempts: 32,
            lock_retry: RetryPolicy::lock_default(),
            write_retry: RetryPolicy::write_default(),
            lock_stale_after: Some(Duration::from_secs(600)),
        }
    }
}

impl HandshakeConfig {
    pub fn with_lock_retry(mut self, policy: RetryPolicy) -> Self {
        self.lock_retry = policy;
        self
    }

    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    pub fn with_lock_stale_after(mut self, window: Option<Duration>) -> Self {
        self.lock_stale_after = window;
        self
    }

    /// Branch name for a session identifier.
    pub fn slot_name(&self, session_id: &str) -> String {
        format!("{}{}", self.slot_prefix, session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_name() {
        let config = HandshakeConfig::default();
        assert_eq!(
            config.slot_name("AbC123xyz0"),
            "tmp_zero_trust_handshake_branch_AbC123xyz0"
        );
    }
}
