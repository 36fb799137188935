//! [`RemoteObjectStore`] backed by the GitHub REST API.
//!
//! Branches are git refs (`git/refs`), blobs are repository contents
//! (`contents/{path}`), and a file's blob SHA is its version tag. The
//! contents API rejects a `PUT` whose `sha` is stale, which gives us the
//! compare-and-swap write the lock relies on.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ztshake_core::{Blob, RemoteObjectStore, StoreError, VersionTag};

use crate::config::GitHubSettings;

const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("ztshake/", env!("CARGO_PKG_VERSION"));

/// Which call a failed response belongs to; status codes mean different
/// things per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Read,
    CreateRef,
    DeleteRef,
    PutBlob,
}

#[derive(Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Deserialize)]
struct GitRef {
    object: RefObject,
}

#[derive(Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    reference: String,
    sha: &'a str,
}

#[derive(Deserialize)]
struct ContentsFile {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
    sha: String,
}

#[derive(Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Deserialize)]
struct PutContentsResponse {
    content: ContentsMeta,
}

#[derive(Deserialize)]
struct ContentsMeta {
    sha: String,
}

/// GitHub repository as an object store.
pub struct GitHubStore {
    client: reqwest::Client,
    token: String,
    repo_url: String,
}

impl std::fmt::Debug for GitHubStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubStore")
            .field("repo_url", &self.repo_url)
            .finish_non_exhaustive()
    }
}

impl GitHubStore {
    pub fn new(settings: &GitHubSettings) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            token: settings.token.clone(),
            repo_url: format!(
                "{}/repos/{}/{}",
                settings.api_url.trim_end_matches('/'),
                settings.owner,
                settings.repo
            ),
        })
    }

    fn ref_url(&self, branch: &str) -> String {
        format!("{}/git/ref/heads/{}", self.repo_url, branch)
    }

    fn refs_url(&self) -> String {
        format!("{}/git/refs", self.repo_url)
    }

    fn delete_ref_url(&self, branch: &str) -> String {
        format!("{}/git/refs/heads/{}", self.repo_url, branch)
    }

    fn contents_url(&self, path: &str) -> String {
        format!("{}/contents/{}", self.repo_url, path.trim_start_matches('/'))
    }

    async fn send(
        &self,
        operation: Operation,
        what: &str,
        request: RequestBuilder,
    ) -> Result<Response, StoreError> {
        let resp = request
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{} request failed: {}", what, e)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let err = classify_failure(operation, status, &body);
        match err {
            StoreError::Unavailable(_) => warn!("{} failed: {} {}", what, status, body),
            _ => debug!("{} failed: {} {}", what, status, body),
        }
        Err(err)
    }

    async fn parse<T: for<'de> Deserialize<'de>>(what: &str, resp: Response) -> Result<T, StoreError> {
        resp.json::<T>()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Unexpected {} response: {}", what, e)))
    }
}

#[async_trait]
impl RemoteObjectStore for GitHubStore {
    async fn default_head(&self) -> Result<String, StoreError> {
        let resp = self
            .send(Operation::Read, "Get repository", self.client.get(&self.repo_url))
            .await?;
        let repo: RepoInfo = Self::parse("repository", resp).await?;
        debug!("Default branch is {}", repo.default_branch);
        self.get_ref(&repo.default_branch).await
    }

    async fn create_ref(&self, name: &str, at_commit: &str) -> Result<(), StoreError> {
        let body = CreateRefRequest {
            reference: format!("refs/heads/{}", name),
            sha: at_commit,
        };
        self.send(
            Operation::CreateRef,
            "Create branch",
            self.client.post(self.refs_url()).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn get_ref(&self, name: &str) -> Result<String, StoreError> {
        let resp = self
            .send(Operation::Read, "Get branch", self.client.get(self.ref_url(name)))
            .await?;
        let git_ref: GitRef = Self::parse("ref", resp).await?;
        Ok(git_ref.object.sha)
    }

    async fn delete_ref(&self, name: &str) -> Result<(), StoreError> {
        self.send(
            Operation::DeleteRef,
            "Delete branch",
            self.client.delete(self.delete_ref_url(name)),
        )
        .await?;
        Ok(())
    }

    async fn get_blob(&self, branch: &str, path: &str) -> Result<Blob, StoreError> {
        let url = format!("{}?ref={}", self.contents_url(path), branch);
        let resp = self
            .send(Operation::Read, "Get file", self.client.get(url))
            .await?;
        let file: ContentsFile = Self::parse("contents", resp).await?;
        if !file.encoding.is_empty() && file.encoding != "base64" {
            return Err(StoreError::Unavailable(format!(
                "Unsupported content encoding {:?} for {}",
                file.encoding, path
            )));
        }
        Ok(Blob {
            content: decode_content(&file.content)?,
            version: VersionTag(file.sha),
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
        let body = PutContentsRequest {
            message,
            content: STANDARD.encode(content),
            branch,
            sha: expected.map(|v| v.as_str()),
        };
        let resp = self
            .send(
                Operation::PutBlob,
                "Write file",
                self.client.put(self.contents_url(path)).json(&body),
            )
            .await?;
        let written: PutContentsResponse = Self::parse("contents", resp).await?;
        Ok(VersionTag(written.content.sha))
    }
}

/// Map a non-success response to a store error.
///
/// GitHub answers 409 for a stale `sha` and 422 for a missing `sha` on an
/// existing file. On refs, 422 is only a name collision (or, for a delete,
/// an absent branch) when the message says so; any other 422 is a request
/// the API refused outright.
fn classify_failure(operation: Operation, status: StatusCode, body: &str) -> StoreError {
    match (operation, status) {
        (_, StatusCode::NOT_FOUND) => StoreError::NotFound(body.to_string()),
        (Operation::DeleteRef, StatusCode::UNPROCESSABLE_ENTITY)
            if body.contains("Reference does not exist") =>
        {
            StoreError::NotFound(body.to_string())
        }
        (Operation::CreateRef, StatusCode::UNPROCESSABLE_ENTITY)
            if body.contains("Reference already exists") =>
        {
            StoreError::Conflict(body.to_string())
        }
        (Operation::PutBlob, StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY) => {
            StoreError::Conflict(body.to_string())
        }
        _ => StoreError::Unavailable(format!("{} {}", status, body)),
    }
}

/// The contents API wraps base64 at 60 columns.
fn decode_content(encoded: &str) -> Result<Vec<u8>, StoreError> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| StoreError::Unavailable(format!("Invalid base64 content: {}", e)))
}
