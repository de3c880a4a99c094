//! Confirmation-form driver contract and bounded waits.
//!
//! Real DOM automation is out of scope; the driver is a narrow trait with
//! an HTTP-posting default implementation. Waiting on driver-side state is
//! modeled as an explicit bounded-wait machine with a classified outcome
//! instead of ad-hoc polling loops.

use crate::cancellation::RunToken;
use crate::errors::{classify_http_status, classify_transport_error, StepError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Named form fields submitted alongside the artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormFields(pub BTreeMap<String, String>);

impl FormFields {
    /// Creates an empty field set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormReceipt {
    /// Confirmation identifier returned by the form, when available.
    pub confirmation: Option<String>,
    /// Screenshot captured as submission evidence, when the driver takes one.
    pub screenshot: Option<PathBuf>,
}

/// A browser-automation driver reduced to its retry-contract surface.
#[async_trait]
pub trait FormDriver: Send + Sync {
    /// Lightweight availability check used by the health gate.
    async fn ping(&self) -> Result<(), StepError>;

    /// Submits the form with the artifact attached.
    async fn submit(&self, artifact: &Path, fields: &FormFields) -> Result<FormReceipt, StepError>;
}

/// Driver that posts the submission as JSON to a webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookFormDriver {
    client: reqwest::Client,
    url: String,
}

impl WebhookFormDriver {
    /// Creates a driver posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, StepError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StepError::fatal(format!("http client construction failed: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl FormDriver for WebhookFormDriver {
    async fn ping(&self) -> Result<(), StepError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;
        let status = response.status();
        // Forms commonly reject GET; reachability is all the probe needs.
        if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            Ok(())
        } else {
            Err(classify_http_status(status, &self.url))
        }
    }

    async fn submit(&self, artifact: &Path, fields: &FormFields) -> Result<FormReceipt, StepError> {
        let artifact_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                StepError::validation(format!("artifact has no file name: {}", artifact.display()))
            })?;

        let payload = serde_json::json!({
            "fields": fields,
            "artifact": artifact_name,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_status(status, &self.url));
        }

        let confirmation = response
            .headers()
            .get("x-confirmation-id")
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        tracing::info!(url = %self.url, confirmation = ?confirmation, "form submitted");
        Ok(FormReceipt {
            confirmation,
            screenshot: None,
        })
    }
}

/// Health probe over a [`FormDriver`].
pub struct DriverProbe {
    driver: std::sync::Arc<dyn FormDriver>,
}

impl DriverProbe {
    /// Creates a probe over the given driver.
    #[must_use]
    pub fn new(driver: std::sync::Arc<dyn FormDriver>) -> Self {
        Self { driver }
    }
}

impl std::fmt::Debug for DriverProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverProbe").finish()
    }
}

#[async_trait]
impl crate::health::DependencyProbe for DriverProbe {
    fn name(&self) -> &str {
        "form-driver"
    }

    async fn probe(&self) -> Result<(), StepError> {
        self.driver.ping().await
    }
}

/// One poll of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPoll<T> {
    /// The awaited state is present.
    Ready(T),
    /// Not there yet; poll again after backoff.
    Pending,
    /// The observed target disappeared; waiting further is pointless.
    Detached,
}

/// Classified outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The awaited state appeared.
    Found(T),
    /// The attempt budget ran out (or the run was cancelled).
    Timeout,
    /// The target detached before the budget ran out.
    Detached,
}

/// Polls `probe` under the policy's backoff schedule until it reports ready,
/// detaches, or the attempt budget runs out. Cancellation of `token` ends
/// the wait as a timeout.
pub async fn wait_until<T, F, Fut>(
    policy: &RetryPolicy,
    token: &RunToken,
    mut probe: F,
) -> WaitOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WaitPoll<T>>,
{
    for attempt in 1..=policy.max_attempts {
        match probe().await {
            WaitPoll::Ready(value) => return WaitOutcome::Found(value),
            WaitPoll::Detached => return WaitOutcome::Detached,
            WaitPoll::Pending => {}
        }

        if attempt == policy.max_attempts {
            break;
        }

        let delay = policy.jittered(policy.backoff_delay(attempt));
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = token.cancelled() => return WaitOutcome::Timeout,
        }
    }
    WaitOutcome::Timeout
}
