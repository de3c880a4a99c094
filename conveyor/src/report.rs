//! Report artifact rendering.
//!
//! The renderer is a pure collaborator: stored records plus aggregates in,
//! one dated JSON artifact out. Spreadsheet layout is deliberately out of
//! scope; the JSON artifact carries the same products + summary content.

use crate::errors::StepError;
use crate::store::{CatalogStats, StoredRecord};
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};

/// Renders the dated catalog report artifact.
#[derive(Debug, Clone)]
pub struct ReportRenderer {
    report_dir: PathBuf,
}

impl ReportRenderer {
    /// Creates a renderer writing into `report_dir`.
    #[must_use]
    pub fn new(report_dir: impl Into<PathBuf>) -> Self {
        Self {
            report_dir: report_dir.into(),
        }
    }

    /// Deterministic artifact name for a run date.
    #[must_use]
    pub fn artifact_name(date: NaiveDate) -> String {
        format!("catalog_report_{}.json", date.format("%Y-%m-%d"))
    }

    /// Renders the report for `date` and returns the artifact path.
    ///
    /// # Errors
    ///
    /// Returns an error if the report directory or file cannot be written.
    pub fn render(
        &self,
        date: NaiveDate,
        products: &[StoredRecord],
        stats: &CatalogStats,
    ) -> Result<PathBuf, StepError> {
        std::fs::create_dir_all(&self.report_dir).map_err(|e| {
            StepError::fatal(format!("cannot create {}: {e}", self.report_dir.display()))
        })?;

        let path = self.report_dir.join(Self::artifact_name(date));
        let body = serde_json::json!({
            "generated_at": Utc::now().to_rfc3339(),
            "report_date": date.format("%Y-%m-%d").to_string(),
            "summary": stats,
            "products": products,
        });

        let rendered = serde_json::to_vec_pretty(&body)
            .map_err(|e| StepError::fatal(format!("report serialization failed: {e}")))?;
        std::fs::write(&path, rendered)
            .map_err(|e| StepError::fatal(format!("cannot write {}: {e}", path.display())))?;

        tracing::info!(path = %path.display(), products = products.len(), "report rendered");
        Ok(path)
    }

    /// Returns the configured report directory.
    #[must_use]
    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CategoryStats;

    fn stored(id: i64, category: &str, price: f64) -> StoredRecord {
        StoredRecord {
            id,
            title: format!("Product {id}"),
            price,
            category: category.to_string(),
            description: String::new(),
            inserted_at: "2025-03-09T00:00:00+00:00".to_string(),
        }
    }

    fn stats() -> CatalogStats {
        CatalogStats {
            total_products: 2,
            avg_price: 15.0,
            categories: vec![CategoryStats {
                category: "tools".to_string(),
                count: 2,
                avg_price: 15.0,
                min_price: 10.0,
                max_price: 20.0,
            }],
        }
    }

    #[test]
    fn test_artifact_name_is_deterministic_by_date() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(ReportRenderer::artifact_name(date), "catalog_report_2025-03-09.json");
    }

    #[test]
    fn test_render_writes_summary_and_products() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ReportRenderer::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();

        let path = renderer
            .render(date, &[stored(1, "tools", 10.0), stored(2, "tools", 20.0)], &stats())
            .unwrap();

        let body: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(body["report_date"], "2025-03-09");
        assert_eq!(body["summary"]["total_products"], 2);
        assert_eq!(body["products"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_render_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("out").join("reports");
        let renderer = ReportRenderer::new(&nested);
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();

        let path = renderer.render(date, &[], &CatalogStats {
            total_products: 0,
            avg_price: 0.0,
            categories: vec![],
        }).unwrap();
        assert!(path.starts_with(&nested));
        assert!(path.exists());
    }
}
