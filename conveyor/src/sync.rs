//! Conflict-safe artifact synchronization to a remote object store.
//!
//! [`SyncClient`] never silently overwrites an existing remote object. A
//! collision is resolved deterministically with a second-resolution
//! timestamp suffix, re-checked a bounded number of times because the
//! existence-check-then-put window is not atomic against external writers.
//! Network-level failures are retried through [`RetryExecutor`], not a
//! bespoke loop.

use crate::cancellation::RunToken;
use crate::errors::{classify_http_status, classify_transport_error, ErrorKind, StepError};
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// How many suffix candidates are tried before giving up on a collision.
const MAX_SUFFIX_ATTEMPTS: usize = 3;

/// What to do when the remote path already holds an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Append a timestamp suffix before the extension and upload there.
    #[default]
    VersionSuffix,
    /// Report a conflict without uploading.
    Fail,
}

/// One artifact upload, consumed exactly once.
#[derive(Debug, Clone)]
pub struct SyncTask {
    /// The local artifact to upload.
    pub local_path: PathBuf,
    /// The desired remote path.
    pub remote_path: String,
    /// Conflict-resolution policy for this task.
    pub conflict_strategy: ConflictStrategy,
}

/// How the upload concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Uploaded to the requested path.
    Uploaded,
    /// Uploaded under a version-suffixed path after a collision.
    UploadedVersioned,
}

/// Result of a completed upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReceipt {
    /// The remote path the artifact actually landed at.
    pub remote_path: String,
    /// Whether conflict resolution renamed the object.
    pub status: SyncStatus,
    /// Uploaded payload size.
    pub bytes: u64,
}

/// A remote object store with existence checks and create-only writes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns whether an object exists at the path.
    async fn exists(&self, remote_path: &str) -> Result<bool, StepError>;

    /// Stores an object at the path. Implementations must refuse to
    /// overwrite and report [`ErrorKind::Conflict`] instead.
    async fn put(&self, remote_path: &str, data: &[u8]) -> Result<(), StepError>;
}

/// In-memory object store used by tests and offline runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a stored object's bytes, if present.
    #[must_use]
    pub fn object(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.objects.get(remote_path).map(|entry| entry.value().clone())
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, remote_path: &str) -> Result<bool, StepError> {
        Ok(self.objects.contains_key(remote_path))
    }

    async fn put(&self, remote_path: &str, data: &[u8]) -> Result<(), StepError> {
        match self.objects.entry(remote_path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StepError::conflict(format!(
                "remote object already exists at '{remote_path}'"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(data.to_vec());
                Ok(())
            }
        }
    }
}

/// Object store over a plain HTTP interface: `GET` to probe, `PUT` to write.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpObjectStore {
    /// Creates a store rooted at `base_url`, optionally authenticated.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: Option<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, StepError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StepError::fatal(format!("http client construction failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            bearer_token,
        })
    }

    fn object_url(&self, remote_path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            remote_path.trim_start_matches('/')
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn exists(&self, remote_path: &str) -> Result<bool, StepError> {
        let url = self.object_url(remote_path);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if status.is_success() {
            return Ok(true);
        }
        Err(classify_http_status(status, &url))
    }

    async fn put(&self, remote_path: &str, data: &[u8]) -> Result<(), StepError> {
        let url = self.object_url(remote_path);
        let response = self
            .authorized(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            // Create-only: a concurrent writer surfaces as 412.
            .header(reqwest::header::IF_NONE_MATCH, "*")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if status == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(StepError::conflict(format!(
                "remote object already exists at '{remote_path}'"
            )));
        }
        if status.is_success() {
            return Ok(());
        }
        Err(classify_http_status(status, &url))
    }
}

/// Builds a version-suffixed remote path: the second-resolution timestamp
/// (plus a disambiguating counter after the first collision) is inserted
/// before the extension.
#[must_use]
pub fn versioned_remote_path(remote_path: &str, at: DateTime<Utc>, attempt: usize) -> String {
    let stamp = at.format("%Y%m%d_%H%M%S");
    let suffix = if attempt == 0 {
        format!("_{stamp}")
    } else {
        format!("_{stamp}_{attempt}")
    };

    match remote_path.rsplit_once('.') {
        // Guard against dotted directories with extension-less file names.
        Some((stem, ext)) if !ext.contains('/') => format!("{stem}{suffix}.{ext}"),
        _ => format!("{remote_path}{suffix}"),
    }
}

/// Uploads local artifacts without ever overwriting remote objects.
pub struct SyncClient {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient").field("retry", &self.retry).finish()
    }
}

impl SyncClient {
    /// Creates a client over the given store; `retry` should carry the
    /// network-tuned policy.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryExecutor) -> Self {
        Self { store, retry }
    }

    async fn exists_retried(&self, token: &RunToken, path: &str) -> Result<bool, StepError> {
        let store = &self.store;
        self.retry
            .execute("sync.exists", token, || {
                let store = store.clone();
                let path = path.to_string();
                async move { store.exists(&path).await }
            })
            .await
            .map(|retried| retried.value)
            .map_err(crate::retry::RetryFailure::into_step_error)
    }

    async fn put_retried(&self, token: &RunToken, path: &str, data: &[u8]) -> Result<(), StepError> {
        let store = &self.store;
        self.retry
            .execute("sync.put", token, || {
                let store = store.clone();
                let path = path.to_string();
                let data = data.to_vec();
                async move { store.put(&path, &data).await }
            })
            .await
            .map(|_| ())
            .map_err(crate::retry::RetryFailure::into_step_error)
    }

    /// Uploads the task's artifact, resolving remote-path conflicts per the
    /// task's strategy.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the local artifact is missing, a
    /// conflict error when the strategy forbids resolution or suffix
    /// generation stays contested, and transport errors once the network
    /// retry policy is exhausted.
    pub async fn upload(&self, task: &SyncTask, token: &RunToken) -> Result<SyncReceipt, StepError> {
        let data = std::fs::read(&task.local_path).map_err(|e| {
            StepError::validation(format!(
                "local artifact missing at {}: {e}",
                task.local_path.display()
            ))
        })?;
        let bytes = data.len() as u64;

        let occupied = self.exists_retried(token, &task.remote_path).await?;
        if !occupied {
            // The window between the check and the put is not exclusive; a
            // conflict here falls through to suffix resolution.
            match self.put_retried(token, &task.remote_path, &data).await {
                Ok(()) => {
                    tracing::info!(remote = %task.remote_path, bytes, "artifact uploaded");
                    return Ok(SyncReceipt {
                        remote_path: task.remote_path.clone(),
                        status: SyncStatus::Uploaded,
                        bytes,
                    });
                }
                Err(err) if err.kind == ErrorKind::Conflict => {
                    tracing::warn!(remote = %task.remote_path, "object appeared after existence check");
                }
                Err(err) => return Err(err),
            }
        }

        if task.conflict_strategy == ConflictStrategy::Fail {
            return Err(StepError::conflict(format!(
                "remote object already exists at '{}'",
                task.remote_path
            )));
        }

        for attempt in 0..MAX_SUFFIX_ATTEMPTS {
            let candidate = versioned_remote_path(&task.remote_path, Utc::now(), attempt);
            if self.exists_retried(token, &candidate).await? {
                tracing::warn!(remote = %candidate, attempt, "suffixed path also occupied");
                continue;
            }
            match self.put_retried(token, &candidate, &data).await {
                Ok(()) => {
                    tracing::info!(remote = %candidate, bytes, "artifact uploaded under versioned path");
                    return Ok(SyncReceipt {
                        remote_path: candidate,
                        status: SyncStatus::UploadedVersioned,
                        bytes,
                    });
                }
                Err(err) if err.kind == ErrorKind::Conflict => {
                    tracing::warn!(remote = %candidate, attempt, "lost race on suffixed path");
                }
                Err(err) => return Err(err),
            }
        }

        Err(StepError::conflict(format!(
            "conflict unresolved for '{}' after {MAX_SUFFIX_ATTEMPTS} suffix attempts",
            task.remote_path
        )))
    }
}
