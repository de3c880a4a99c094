//! Catalog records and the remote catalog source.
//!
//! The source is a thin collaborator: an HTTP GET that yields a record list
//! or a classified failure. Response schema beyond the persisted fields is
//! deliberately not modeled; unknown fields are ignored.

use crate::errors::{classify_http_status, classify_transport_error, StepError};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A catalog record keyed by its external numeric identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// External identity; the dedup key.
    pub id: i64,
    /// Product title.
    pub title: String,
    /// Unit price.
    pub price: f64,
    /// Product category.
    pub category: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

impl CatalogRecord {
    /// Validates the minimal shape required for persistence.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending field.
    pub fn validate(&self) -> Result<(), StepError> {
        if self.id <= 0 {
            return Err(StepError::validation(format!(
                "record id must be positive, got {}",
                self.id
            )));
        }
        if self.title.trim().is_empty() {
            return Err(StepError::validation(format!(
                "record {} has an empty title",
                self.id
            )));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(StepError::validation(format!(
                "record {} has an invalid price {}",
                self.id, self.price
            )));
        }
        Ok(())
    }
}

/// A source of catalog records.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetches the full record list.
    async fn fetch(&self) -> Result<Vec<CatalogRecord>, StepError>;
}

/// Catalog source backed by an HTTP endpoint returning a JSON array.
#[derive(Debug, Clone)]
pub struct HttpCatalogSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCatalogSource {
    /// Creates a source for the given endpoint with a request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, StepError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StepError::fatal(format!("http client construction failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Returns the configured endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch(&self) -> Result<Vec<CatalogRecord>, StepError> {
        tracing::info!(endpoint = %self.endpoint, "fetching catalog");

        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_status(status, &self.endpoint));
        }

        let records: Vec<CatalogRecord> = response
            .json()
            .await
            .map_err(|e| StepError::validation(format!("catalog response is not a record list: {e}")))?;

        tracing::info!(count = records.len(), "catalog fetched");
        Ok(records)
    }
}

/// Writes the fetched records as a dated raw snapshot under `data_dir/raw`.
///
/// Returns the snapshot path.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn write_raw_snapshot(
    data_dir: &Path,
    date: NaiveDate,
    records: &[CatalogRecord],
) -> Result<PathBuf, StepError> {
    let raw_dir = data_dir.join("raw");
    std::fs::create_dir_all(&raw_dir)
        .map_err(|e| StepError::fatal(format!("cannot create {}: {e}", raw_dir.display())))?;

    let path = raw_dir.join(format!("catalog_{}.json", date.format("%Y-%m-%d")));
    let body = serde_json::to_vec_pretty(records)
        .map_err(|e| StepError::fatal(format!("snapshot serialization failed: {e}")))?;
    std::fs::write(&path, body)
        .map_err(|e| StepError::fatal(format!("cannot write {}: {e}", path.display())))?;

    tracing::debug!(path = %path.display(), count = records.len(), "raw snapshot written");
    Ok(path)
}
