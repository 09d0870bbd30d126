//! Remote save adapter: third-party-hosted file backends.
//!
//! Some documents are additionally saved to an external file host (a git
//! forge, a gist-style service). The host runs its own optimistic
//! concurrency on a content token: a save must present the token of the
//! last known remote content, and a mismatch is a conflict with the same
//! whole-entity semantics as the sync service, never a retryable failure.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// One save of a document to the external host.
#[derive(Debug, Clone)]
pub struct SaveRequest<'a> {
    /// Repository (or equivalent container) on the host.
    pub repo: &'a str,
    /// File path within the repository.
    pub path: &'a str,
    pub content: &'a str,
    /// Commit/change message.
    pub message: &'a str,
    /// Token of the last known remote content; None when the file is
    /// expected not to exist yet.
    pub expected_token: Option<&'a str>,
    pub branch: &'a str,
}

/// Successful save: the token for the content just written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveAck {
    pub token: String,
}

#[derive(Debug, Error)]
pub enum SaveError {
    /// The remote content changed since `expected_token` was recorded.
    #[error("save conflict: remote content changed")]
    Conflict {
        /// The host's current token; None when the file was deleted there.
        current_token: Option<String>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

pub type Result<T> = std::result::Result<T, SaveError>;

/// The external file host's save endpoint.
#[async_trait]
pub trait RemoteFileBackend: Send + Sync {
    async fn save(&self, request: &SaveRequest<'_>) -> Result<SaveAck>;
}

/// FNV-1a hash of the content, hex-encoded: the concurrency token used by
/// [`InMemoryFileBackend`] and for change detection before saving.
pub fn content_token(content: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in content.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

/// Where one document saves remotely, plus the last token seen there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveBinding {
    pub repo: String,
    pub path: String,
    pub branch: String,
    /// Token of the last acknowledged save; None before the first save.
    pub token: Option<String>,
}

/// Document-id to remote-location bindings.
#[derive(Debug, Default)]
pub struct SaveTracker {
    bindings: HashMap<String, SaveBinding>,
}

impl SaveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a document to a remote file location.
    pub fn bind(
        &mut self,
        document_id: impl Into<String>,
        repo: impl Into<String>,
        path: impl Into<String>,
        branch: impl Into<String>,
    ) {
        self.bindings.insert(
            document_id.into(),
            SaveBinding {
                repo: repo.into(),
                path: path.into(),
                branch: branch.into(),
                token: None,
            },
        );
    }

    pub fn unbind(&mut self, document_id: &str) -> bool {
        self.bindings.remove(document_id).is_some()
    }

    pub fn get(&self, document_id: &str) -> Option<&SaveBinding> {
        self.bindings.get(document_id)
    }

    /// Record the token returned by an acknowledged save (or adopted from
    /// the host after a conflict decision).
    pub fn record_token(&mut self, document_id: &str, token: impl Into<String>) {
        if let Some(binding) = self.bindings.get_mut(document_id) {
            binding.token = Some(token.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[derive(Debug, Clone)]
struct StoredFile {
    content: String,
    token: String,
}

/// In-process file host with the same token-check semantics as a real one.
#[derive(Default)]
pub struct InMemoryFileBackend {
    files: Mutex<HashMap<(String, String, String), StoredFile>>,
}

impl InMemoryFileBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change a remote file out-of-band, as another device would.
    pub fn seed(&self, repo: &str, branch: &str, path: &str, content: &str) {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.insert(
            (repo.to_string(), branch.to_string(), path.to_string()),
            StoredFile {
                content: content.to_string(),
                token: content_token(content),
            },
        );
    }

    pub fn content(&self, repo: &str, branch: &str, path: &str) -> Option<String> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files
            .get(&(repo.to_string(), branch.to_string(), path.to_string()))
            .map(|f| f.content.clone())
    }
}

#[async_trait]
impl RemoteFileBackend for InMemoryFileBackend {
    async fn save(&self, request: &SaveRequest<'_>) -> Result<SaveAck> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let key = (
            request.repo.to_string(),
            request.branch.to_string(),
            request.path.to_string(),
        );

        let current_token = files.get(&key).map(|f| f.token.clone());
        if request.expected_token != current_token.as_deref() {
            return Err(SaveError::Conflict { current_token });
        }

        let token = content_token(request.content);
        files.insert(
            key,
            StoredFile {
                content: request.content.to_string(),
                token: token.clone(),
            },
        );
        Ok(SaveAck { token })
    }
}
