//! Remote object store abstraction.
//!
//! The store is a version-controlled repository: named branches (refs)
//! pointing at commits, and blobs at paths inside a branch. The only atomic
//! primitive is a conditional blob write guarded by a [`VersionTag`].

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

/// Revision marker used as a compare-and-swap precondition on writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionTag(pub String);

impl VersionTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blob content together with the version tag it was read at.
#[derive(Debug, Clone)]
pub struct Blob {
    pub content: Vec<u8>,
    pub version: VersionTag,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// The name already exists, or the expected version tag is stale.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    /// Commit at the head of the repository's default branch.
    async fn default_head(&self) -> Result<String, StoreError>;

    /// Create branch `name` at `at_commit`. `Conflict` if it already exists.
    async fn create_ref(&self, name: &str, at_commit: &str) -> Result<(), StoreError>;

    /// Commit the branch points at. `NotFound` if absent.
    async fn get_ref(&self, name: &str) -> Result<String, StoreError>;

    /// Delete branch `name`. `NotFound` if absent.
    async fn delete_ref(&self, name: &str) -> Result<(), StoreError>;

    /// Read the blob at `path` on `branch`. `NotFound` if branch or file is absent.
    async fn get_blob(&self, branch: &str, path: &str) -> Result<Blob, StoreError>;

    /// Write the blob at `path` on `branch`.
    ///
    /// With `expected = None` the file must not exist yet; otherwise the
    /// write only lands if the current version matches. Both failures are
    /// reported as `Conflict`.
    async fn put_blob(
        &self,
        branch: &str,
        path: &str,
        content: &[u8],
        expected: Option<&VersionTag>,
        message: &str,
    ) -> Result<VersionTag, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredBlob {
    content: Vec<u8>,
    version: VersionTag,
}

#[derive(Debug, Default)]
struct Branch {
    commit: String,
    files: HashMap<String, StoredBlob>,
}

#[derive(Debug, Default)]
struct Repo {
    branches: HashMap<String, Branch>,
    writes: u64,
}

/// In-process store used by tests and local tooling.
///
/// Every call yields to the runtime once before touching state so that
/// concurrent tasks actually interleave.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    default_branch: String,
    repo: Mutex<Repo>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::with_default_branch("main")
    }

    pub fn with_default_branch(name: impl Into<String>) -> Self {
        let default_branch = name.into();
        let mut repo = Repo::default();
        repo.branches.insert(
            default_branch.clone(),
            Branch {
                commit: commit_id(default_branch.as_bytes(), 0),
                files: HashMap::new(),
            },
        );
        Self {
            default_branch,
            repo: Mutex::new(repo),
        }
    }

    /// Names of all branches, sorted.
    pub fn branch_names(&self) -> Vec<String> {
        let repo = match self.repo.lock() {
            Ok(repo) => repo,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = repo.branches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total number of successful blob writes.
    pub fn write_count(&self) -> u64 {
        match self.repo.lock() {
            Ok(repo) => repo.writes,
            Err(poisoned) => poisoned.into_inner().writes,
        }
    }

    fn lock_repo(&self) -> Result<std::sync::MutexGuard<'_, Repo>, StoreError> {
        self.repo
            .lock()
            .map_err(|_| StoreError::Unavailable("Failed to lock in-memory store".to_string()))
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

fn commit_id(seed: &[u8], counter: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(counter.to_be_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl RemoteObjectStore for InMemoryObjectStore {
    async fn default_head(&self) -> Result<String, StoreError> {
        tokio::task::yield_now().await;
        let repo = self.lock_repo()?;
        repo.branches
            .get(&self.default_branch)
            .map(|b| b.commit.clone())
            .ok_or_else(|| StoreError::NotFound(format!("heads/{}", self.default_branch)))
    }

    async fn create_ref(&self, name: &str, at_commit: &str) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        let mut repo = self.lock_repo()?;
        if repo.branches.contains_key(name) {
            return Err(StoreError::Conflict(format!(
                "Reference already exists: heads/{}",
                name
            )));
        }
        repo.branches.insert(
            name.to_string(),
            Branch {
                commit: at_commit.to_string(),
                files: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn get_ref(&self, name: &str) -> Result<String, StoreError> {
        tokio::task::yield_now().await;
        let repo = self.lock_repo()?;
        repo.branches
            .get(name)
            .map(|b| b.commit.clone())
            .ok_or_else(|| StoreError::NotFound(format!("heads/{}", name)))
    }

    async fn delete_ref(&self, name: &str) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        let mut repo = self.lock_repo()?;
        repo.branches
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("heads/{}", name)))
    }

    async fn get_blob(&self, branch: &str, path: &str) -> Result<Blob, StoreError> {
        tokio::task::yield_now().await;
        let repo = self.lock_repo()?;
        let b = repo
            .branches
            .get(branch)
            .ok_or_else(|| StoreError::NotFound(format!("heads/{}", branch)))?;
        let stored = b
            .files
            .get(path)
            .ok_or_else(|| StoreError::NotFound(format!("{} in {}", path, branch)))?;
        Ok(Blob {
            content: stored.content.clone(),
            version: stored.version.clone(),
        })
    }

    async fn put_blob(
        &self,
        branch: &str,
        path: &str,
        content: &[u8],
        expected: Option<&VersionTag>,
        message: &str,
    ) -> Result<VersionTag, StoreError> {
        tokio::task::yield_now().await;
        let mut repo = self.lock_repo()?;
        let counter = repo.writes + 1;
        let b = repo
            .branches
            .get_mut(branch)
            .ok_or_else(|| StoreError::NotFound(format!("heads/{}", branch)))?;

        match (b.files.get(path), expected) {
            (Some(current), Some(tag)) if &current.version != tag => {
                return Err(StoreError::Conflict(format!(
                    "{} does not match {}",
                    tag, current.version
                )));
            }
            (Some(_), None) => {
                return Err(StoreError::Conflict(format!(
                    "{} already exists and no version was supplied",
                    path
                )));
            }
            (None, Some(tag)) => {
                return Err(StoreError::Conflict(format!(
                    "{} does not exist, expected version {}",
                    path, tag
                )));
            }
            _ => {}
        }

        let version = VersionTag(commit_id(content, counter));
        b.files.insert(
            path.to_string(),
            StoredBlob {
                content: content.to_vec(),
                version: version.clone(),
            },
        );
        b.commit = commit_id(message.as_bytes(), counter);
        repo.writes = counter;
        Ok(version)
    }
}
