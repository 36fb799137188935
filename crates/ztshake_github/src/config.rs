use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use ztshake_core::{HandshakeConfig, Provenance, RetryPolicy};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_SERVER_URL: &str = "https://github.com";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("GITHUB_REPOSITORY must look like owner/repo, got {0:?}")]
    InvalidRepository(String),
}

/// GitHub access and handshake tuning loaded from environment variables.
#[derive(Clone)]
pub struct GitHubSettings {
    /// Bearer credential for the REST API
    pub token: String,
    pub owner: String,
    pub repo: String,
    /// REST API base URL (default: https://api.github.com)
    pub api_url: String,
    /// Web base URL, used for run links (default: https://github.com)
    pub server_url: String,
    /// Lock attempts (default: 5)
    pub lock_tries: u32,
    /// Seconds between lock attempts (default: 3)
    pub lock_delay_secs: u64,
    /// Retries after a lost write race (default: 10)
    pub write_retries: u32,
    /// Milliseconds between write retries (default: 1000)
    pub write_delay_ms: u64,
    /// Seconds before a held lock counts as abandoned; 0 never reclaims (default: 600)
    pub lock_stale_secs: u64,
}

impl std::fmt::Debug for GitHubSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubSettings")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("api_url", &self.api_url)
            .field("server_url", &self.server_url)
            .field("lock_tries", &self.lock_tries)
            .field("lock_delay_secs", &self.lock_delay_secs)
            .field("write_retries", &self.write_retries)
            .field("write_delay_ms", &self.write_delay_ms)
            .field("lock_stale_secs", &self.lock_stale_secs)
            .finish_non_exhaustive()
    }
}

impl GitHubSettings {
    /// Load settings from the process environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, SettingsError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = non_empty(lookup("GITHUB_TOKEN")).ok_or(SettingsError::Missing("GITHUB_TOKEN"))?;
        let repository =
            non_empty(lookup("GITHUB_REPOSITORY")).ok_or(SettingsError::Missing("GITHUB_REPOSITORY"))?;
        let (owner, repo) = parse_repository(&repository)?;

        let api_url = non_empty(lookup("GITHUB_API_URL"))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let server_url = non_empty(lookup("GITHUB_SERVER_URL"))
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(GitHubSettings {
            token,
            owner,
            repo,
            api_url,
            server_url,
            lock_tries: parse_or(lookup("HANDSHAKE_LOCK_TRIES"), 5),
            lock_delay_secs: parse_or(lookup("HANDSHAKE_LOCK_DELAY_SECS"), 3),
            write_retries: parse_or(lookup("HANDSHAKE_WRITE_RETRIES"), 10),
            write_delay_ms: parse_or(lookup("HANDSHAKE_WRITE_DELAY_MS"), 1000),
            lock_stale_secs: parse_or(lookup("HANDSHAKE_LOCK_STALE_SECS"), 600),
        })
    }

    /// Session tuning derived from these settings.
    pub fn handshake_config(&self) -> HandshakeConfig {
        let stale_after = match self.lock_stale_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        HandshakeConfig::default()
            .with_lock_retry(RetryPolicy::new(
                self.lock_tries,
                Duration::from_secs(self.lock_delay_secs),
            ))
            .with_write_retry(RetryPolicy::new(
                self.write_retries.saturating_add(1),
                Duration::from_millis(self.write_delay_ms),
            ))
            .with_lock_stale_after(stale_after)
    }

    /// Web link to a workflow run in this repository.
    pub fn run_url(&self, run_id: u64) -> String {
        format!(
            "{}/{}/{}/actions/runs/{}",
            self.server_url, self.owner, self.repo, run_id
        )
    }
}

/// Who is running this workflow, from the standard Actions variables.
pub fn provenance_from_env() -> Provenance {
    provenance_from_lookup(|key| env::var(key).ok())
}

pub fn provenance_from_lookup<F>(lookup: F) -> Provenance
where
    F: Fn(&str) -> Option<String>,
{
    let created_by = non_empty(lookup("GITHUB_ACTOR")).unwrap_or_default();
    let run_id = parse_or(lookup("GITHUB_RUN_ID"), 0u64);
    let server_url = non_empty(lookup("GITHUB_SERVER_URL"))
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

    let run_url = match non_empty(lookup("GITHUB_REPOSITORY")) {
        Some(repository) if run_id != 0 => format!(
            "{}/{}/actions/runs/{}",
            server_url.trim_end_matches('/'),
            repository,
            run_id
        ),
        _ => String::new(),
    };

    Provenance {
        created_by,
        run_id,
        run_url,
    }
}

fn parse_repository(value: &str) -> Result<(String, String), SettingsError> {
    match value.trim().split_once('/') {
        Some((owner, repo))
            if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') =>
        {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(SettingsError::InvalidRepository(value.to_string())),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = GitHubSettings::from_lookup(lookup(&[
            ("GITHUB_TOKEN", "ghs_secret"),
            ("GITHUB_REPOSITORY", "octo/handshake"),
        ]))
        .unwrap();
        assert_eq!(settings.owner, "octo");
        assert_eq!(settings.repo, "handshake");
        assert_eq!(settings.api_url, DEFAULT_API_URL);

        let config = settings.handshake_config();
        assert_eq!(config.lock_retry, RetryPolicy::lock_default());
        assert_eq!(config.write_retry, RetryPolicy::write_default());
        assert_eq!(config.lock_stale_after, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_missing_required() {
        let err = GitHubSettings::from_lookup(lookup(&[("GITHUB_REPOSITORY", "o/r")])).unwrap_err();
        assert!(matches!(err, SettingsError::Missing("GITHUB_TOKEN")));

        let err = GitHubSettings::from_lookup(lookup(&[("GITHUB_TOKEN", "t")])).unwrap_err();
        assert!(matches!(err, SettingsError::Missing("GITHUB_REPOSITORY")));
    }

    #[test]
    fn test_bad_repository() {
        for bad in ["noslash", "/repo", "owner/", "a/b/c"] {
            let err = GitHubSettings::from_lookup(lookup(&[
                ("GITHUB_TOKEN", "t"),
                ("GITHUB_REPOSITORY", bad),
            ]))
            .unwrap_err();
            assert!(matches!(err, SettingsError::InvalidRepository(_)), "{}", bad);
        }
    }

    #[test]
    fn test_overrides_and_fallbacks() {
        let settings = GitHubSettings::from_lookup(lookup(&[
            ("GITHUB_TOKEN", "t"),
            ("GITHUB_REPOSITORY", "o/r"),
            ("GITHUB_API_URL", "https://ghe.example.com/api/v3/"),
            ("HANDSHAKE_LOCK_TRIES", "8"),
            ("HANDSHAKE_LOCK_DELAY_SECS", "not-a-number"),
            ("HANDSHAKE_WRITE_RETRIES", "2"),
            ("HANDSHAKE_WRITE_DELAY_MS", "50"),
            ("HANDSHAKE_LOCK_STALE_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(settings.api_url, "https://ghe.example.com/api/v3");

        let config = settings.handshake_config();
        assert_eq!(config.lock_retry, RetryPolicy::new(8, Duration::from_secs(3)));
        assert_eq!(config.write_retry, RetryPolicy::new(3, Duration::from_millis(50)));
        assert_eq!(config.lock_stale_after, None);
    }

    #[test]
    fn test_debug_hides_token() {
        let settings = GitHubSettings::from_lookup(lookup(&[
            ("GITHUB_TOKEN", "ghs_secret"),
            ("GITHUB_REPOSITORY", "o/r"),
        ]))
        .unwrap();
        assert!(!format!("{:?}", settings).contains("ghs_secret"));
    }

    #[test]
    fn test_provenance() {
        let provenance = provenance_from_lookup(lookup(&[
            ("GITHUB_ACTOR", "octocat"),
            ("GITHUB_RUN_ID", "123456"),
            ("GITHUB_REPOSITORY", "octo/handshake"),
        ]));
        assert_eq!(provenance.created_by, "octocat");
        assert_eq!(provenance.run_id, 123456);
        assert_eq!(
            provenance.run_url,
            "https://github.com/octo/handshake/actions/runs/123456"
        );

        let outside_actions = provenance_from_lookup(lookup(&[]));
        assert_eq!(outside_actions, Provenance::default());
    }
}
