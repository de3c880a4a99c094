//! Concrete pipeline steps and plan assembly.
//!
//! Wires the collaborators (catalog source, dedup store, renderer, sync
//! client, form driver, evidence log) into [`StepAction`]s and declares the
//! catalog pipeline: fetch -> persist -> render -> {upload, submit} plus a
//! trailing evidence step.

use crate::cancellation::RunToken;
use crate::catalog::{write_raw_snapshot, CatalogRecord, CatalogSource};
use crate::config::AppConfig;
use crate::errors::{ErrorKind, PlanError, StepError};
use crate::evidence::EvidenceLog;
use crate::form::{wait_until, FormDriver, FormFields, WaitOutcome, WaitPoll};
use crate::orchestrator::{Criticality, RunPlan, StepAction, StepDescriptor, StepId, StepOutput};
use crate::report::ReportRenderer;
use crate::retry::RetryPolicy;
use crate::store::DedupStore;
use crate::sync::{ConflictStrategy, SyncClient, SyncTask};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Data handed from one step to the next within a single run.
#[derive(Debug, Default)]
pub struct PipelineState {
    records: RwLock<Vec<CatalogRecord>>,
    report: RwLock<Option<PathBuf>>,
}

impl PipelineState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The records fetched this run.
    #[must_use]
    pub fn records(&self) -> Vec<CatalogRecord> {
        self.records.read().clone()
    }

    /// The rendered report artifact, once available.
    #[must_use]
    pub fn report_path(&self) -> Option<PathBuf> {
        self.report.read().clone()
    }
}

/// Fetches the catalog and writes the dated raw snapshot.
struct FetchCatalogStep {
    source: Arc<dyn CatalogSource>,
    state: Arc<PipelineState>,
    data_dir: PathBuf,
    evidence: Arc<EvidenceLog>,
}

#[async_trait]
impl StepAction for FetchCatalogStep {
    async fn run(&self, _token: &RunToken) -> Result<StepOutput, StepError> {
        let records = self.source.fetch().await?;

        let snapshot = write_raw_snapshot(&self.data_dir, Utc::now().date_naive(), &records)?;
        self.evidence.record_file("raw_snapshot", &snapshot);

        let count = records.len();
        *self.state.records.write() = records;
        Ok(StepOutput::with_detail(serde_json::json!({
            "count": count,
            "snapshot": snapshot.display().to_string(),
        })))
    }
}

/// Persists the fetched batch idempotently.
struct PersistRecordsStep {
    store: Arc<DedupStore>,
    state: Arc<PipelineState>,
}

#[async_trait]
impl StepAction for PersistRecordsStep {
    async fn run(&self, _token: &RunToken) -> Result<StepOutput, StepError> {
        let records = self.state.records();
        let outcome = self.store.upsert_batch(&records).await?;
        Ok(StepOutput::with_detail(serde_json::json!({
            "inserted": outcome.inserted,
            "skipped": outcome.skipped,
            "invalid": outcome.invalid,
        })))
    }
}

/// Renders the dated report from the stored catalog.
struct RenderReportStep {
    store: Arc<DedupStore>,
    renderer: ReportRenderer,
    state: Arc<PipelineState>,
    evidence: Arc<EvidenceLog>,
}

#[async_trait]
impl StepAction for RenderReportStep {
    async fn run(&self, _token: &RunToken) -> Result<StepOutput, StepError> {
        let products = self.store.fetch_all().await.map_err(StepError::from)?;
        let stats = self.store.statistics().await.map_err(StepError::from)?;

        let path = self.renderer.render(Utc::now().date_naive(), &products, &stats)?;
        self.evidence.record_file("report", &path);

        *self.state.report.write() = Some(path.clone());
        Ok(StepOutput::with_detail(serde_json::json!({
            "path": path.display().to_string(),
            "products": products.len(),
        })))
    }
}

/// Uploads the report artifact to the remote store.
struct UploadReportStep {
    sync: Option<Arc<SyncClient>>,
    state: Arc<PipelineState>,
    reports_prefix: String,
    conflict_strategy: ConflictStrategy,
}

#[async_trait]
impl StepAction for UploadReportStep {
    async fn run(&self, token: &RunToken) -> Result<StepOutput, StepError> {
        let Some(sync) = &self.sync else {
            tracing::info!("remote store not configured; upload skipped");
            return Ok(StepOutput::with_detail(serde_json::json!({
                "skipped": "remote store not configured",
            })));
        };

        let local_path = self
            .state
            .report_path()
            .ok_or_else(|| StepError::validation("report artifact not rendered"))?;
        let remote_path = remote_object_path(&self.reports_prefix, &local_path)?;

        let receipt = sync
            .upload(
                &SyncTask {
                    local_path,
                    remote_path,
                    conflict_strategy: self.conflict_strategy,
                },
                token,
            )
            .await?;

        Ok(StepOutput::with_detail(serde_json::json!({
            "remote_path": receipt.remote_path,
            "status": receipt.status,
            "bytes": receipt.bytes,
        })))
    }
}

/// Marker written after a successful form submission; consulted to avoid
/// re-submitting on the same day.
#[derive(Debug, Serialize, Deserialize)]
struct SubmissionMarker {
    date: String,
    confirmation: Option<String>,
}

/// Submits the confirmation form with the report attached.
struct SubmitFormStep {
    driver: Option<Arc<dyn FormDriver>>,
    state: Arc<PipelineState>,
    evidence_dir: PathBuf,
    evidence: Arc<EvidenceLog>,
    wait_policy: RetryPolicy,
}

impl SubmitFormStep {
    fn marker_path(&self) -> PathBuf {
        self.evidence_dir.join("form_confirmation.json")
    }

    fn submitted_today(&self, today: &str) -> bool {
        let Ok(raw) = std::fs::read(self.marker_path()) else {
            return false;
        };
        serde_json::from_slice::<SubmissionMarker>(&raw)
            .map(|marker| marker.date == today)
            .unwrap_or(false)
    }

    fn write_marker(&self, marker: &SubmissionMarker) -> Result<(), StepError> {
        std::fs::create_dir_all(&self.evidence_dir).map_err(|e| {
            StepError::fatal(format!("cannot create {}: {e}", self.evidence_dir.display()))
        })?;
        let body = serde_json::to_vec_pretty(marker)
            .map_err(|e| StepError::fatal(format!("marker serialization failed: {e}")))?;
        std::fs::write(self.marker_path(), body).map_err(|e| {
            StepError::fatal(format!("cannot write {}: {e}", self.marker_path().display()))
        })?;
        Ok(())
    }
}

#[async_trait]
impl StepAction for SubmitFormStep {
    async fn run(&self, token: &RunToken) -> Result<StepOutput, StepError> {
        let Some(driver) = &self.driver else {
            tracing::info!("form not configured; submission skipped");
            return Ok(StepOutput::with_detail(serde_json::json!({
                "skipped": "form not configured",
            })));
        };

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        if self.submitted_today(&today) {
            tracing::info!(date = %today, "form already submitted today; not re-submitting");
            return Ok(StepOutput::with_detail(serde_json::json!({
                "skipped": "already submitted today",
                "date": today,
            })));
        }

        let artifact = self
            .state
            .report_path()
            .ok_or_else(|| StepError::validation("report artifact not rendered"))?;

        // The form may still be warming up; bounded wait before submitting.
        let readiness = wait_until(&self.wait_policy, token, || {
            let driver = Arc::clone(driver);
            async move {
                match driver.ping().await {
                    Ok(()) => WaitPoll::Ready(()),
                    Err(err) if err.kind == ErrorKind::Fatal => WaitPoll::Detached,
                    Err(_) => WaitPoll::Pending,
                }
            }
        })
        .await;
        match readiness {
            WaitOutcome::Found(()) => {}
            WaitOutcome::Timeout => {
                return Err(StepError::transient("form endpoint not ready within wait budget"));
            }
            WaitOutcome::Detached => {
                return Err(StepError::fatal("form endpoint is gone"));
            }
        }

        let fields = FormFields::new()
            .with("date", today.clone())
            .with("records", self.state.records().len().to_string());
        let receipt = driver.submit(&artifact, &fields).await?;

        self.write_marker(&SubmissionMarker {
            date: today.clone(),
            confirmation: receipt.confirmation.clone(),
        })?;
        self.evidence.record_file("form_confirmation", &self.marker_path());
        if let Some(screenshot) = &receipt.screenshot {
            self.evidence.record_file("form_screenshot", screenshot);
        }

        Ok(StepOutput::with_detail(serde_json::json!({
            "date": today,
            "confirmation": receipt.confirmation,
        })))
    }
}

/// Saves the evidence log and pushes it to the remote log namespace.
struct RecordEvidenceStep {
    evidence: Arc<EvidenceLog>,
    evidence_dir: PathBuf,
    sync: Option<Arc<SyncClient>>,
    logs_prefix: String,
    conflict_strategy: ConflictStrategy,
}

#[async_trait]
impl StepAction for RecordEvidenceStep {
    async fn run(&self, token: &RunToken) -> Result<StepOutput, StepError> {
        let path = self.evidence.save(&self.evidence_dir)?;

        let mut detail = serde_json::json!({
            "path": path.display().to_string(),
        });

        if let Some(sync) = &self.sync {
            let remote_path = remote_object_path(&self.logs_prefix, &path)?;
            let receipt = sync
                .upload(
                    &SyncTask {
                        local_path: path,
                        remote_path,
                        conflict_strategy: self.conflict_strategy,
                    },
                    token,
                )
                .await?;
            detail["remote_path"] = serde_json::json!(receipt.remote_path);
        }

        Ok(StepOutput::with_detail(detail))
    }
}

/// Joins a remote namespace prefix with a local artifact's file name.
fn remote_object_path(prefix: &str, local_path: &Path) -> Result<String, StepError> {
    let name = local_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            StepError::validation(format!("artifact has no file name: {}", local_path.display()))
        })?;
    Ok(format!("{}/{name}", prefix.trim_matches('/')))
}

/// Everything the catalog pipeline needs besides configuration.
pub struct PipelineParts {
    /// Catalog source collaborator.
    pub source: Arc<dyn CatalogSource>,
    /// Deduplicating record store.
    pub store: Arc<DedupStore>,
    /// Sync client for remote uploads; `None` when no remote is configured.
    pub sync: Option<Arc<SyncClient>>,
    /// Form driver; `None` when no form is configured.
    pub driver: Option<Arc<dyn FormDriver>>,
    /// Shared evidence log.
    pub evidence: Arc<EvidenceLog>,
}

/// Declares the full catalog pipeline over the given collaborators.
///
/// # Errors
///
/// Returns a [`PlanError`] if the declaration is invalid (it is not, by
/// construction; the validation still runs).
pub fn build_plan(config: &AppConfig, parts: PipelineParts) -> Result<RunPlan, PlanError> {
    let state = Arc::new(PipelineState::new());

    let fetch = StepDescriptor::new(
        StepId::FetchCatalog,
        Criticality::Critical,
        Arc::new(FetchCatalogStep {
            source: parts.source,
            state: state.clone(),
            data_dir: config.data_dir.clone(),
            evidence: parts.evidence.clone(),
        }),
    );

    let persist = StepDescriptor::new(
        StepId::PersistRecords,
        Criticality::Critical,
        Arc::new(PersistRecordsStep {
            store: parts.store.clone(),
            state: state.clone(),
        }),
    )
    .depends_on(StepId::FetchCatalog);

    let render = StepDescriptor::new(
        StepId::RenderReport,
        Criticality::Critical,
        Arc::new(RenderReportStep {
            store: parts.store,
            renderer: ReportRenderer::new(config.report_dir.clone()),
            state: state.clone(),
            evidence: parts.evidence.clone(),
        }),
    )
    .depends_on(StepId::PersistRecords);

    let upload = StepDescriptor::new(
        StepId::UploadReport,
        Criticality::Optional,
        Arc::new(UploadReportStep {
            sync: parts.sync.clone(),
            state: state.clone(),
            reports_prefix: config.remote.reports_prefix.clone(),
            conflict_strategy: config.remote.report_conflict_strategy,
        }),
    )
    .depends_on(StepId::RenderReport);

    let submit = StepDescriptor::new(
        StepId::SubmitForm,
        Criticality::Optional,
        Arc::new(SubmitFormStep {
            driver: parts.driver,
            state,
            evidence_dir: config.evidence_dir.clone(),
            evidence: parts.evidence.clone(),
            wait_policy: config.retry.clone(),
        }),
    )
    .depends_on(StepId::RenderReport);

    let record = StepDescriptor::new(
        StepId::RecordEvidence,
        Criticality::Optional,
        Arc::new(RecordEvidenceStep {
            evidence: parts.evidence,
            evidence_dir: config.evidence_dir.clone(),
            sync: parts.sync,
            logs_prefix: config.remote.logs_prefix.clone(),
            conflict_strategy: config.remote.log_conflict_strategy,
        }),
    );

    RunPlan::new(vec![fetch, persist, render, upload, submit, record])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthChecker;
    use crate::orchestrator::{Orchestrator, RunStatus, StepStatus};
    use crate::retry::{RetryExecutor, RetryPolicy};
    use crate::sync::MemoryObjectStore;
    use parking_lot::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    struct StaticSource {
        records: Vec<CatalogRecord>,
    }

    #[async_trait]
    impl CatalogSource for StaticSource {
        async fn fetch(&self) -> Result<Vec<CatalogRecord>, StepError> {
            Ok(self.records.clone())
        }
    }

    struct RecordingDriver {
        submissions: Mutex<Vec<FormFields>>,
    }

    impl RecordingDriver {
        fn new() -> Self {
            Self {
                submissions: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FormDriver for RecordingDriver {
        async fn ping(&self) -> Result<(), StepError> {
            Ok(())
        }

        async fn submit(
            &self,
            _artifact: &Path,
            fields: &FormFields,
        ) -> Result<crate::form::FormReceipt, StepError> {
            self.submissions.lock().push(fields.clone());
            Ok(crate::form::FormReceipt {
                confirmation: Some("ok-123".to_string()),
                screenshot: None,
            })
        }
    }

    fn record(id: i64) -> CatalogRecord {
        CatalogRecord {
            id,
            title: format!("Product {id}"),
            price: 5.0,
            category: "tools".to_string(),
            description: String::new(),
        }
    }

    fn test_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.data_dir = root.join("data");
        config.report_dir = root.join("reports");
        config.evidence_dir = root.join("evidence");
        config
    }

    fn fast_executor() -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy::new()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter_ratio(0.0),
        )
    }

    async fn run_pipeline(
        config: &AppConfig,
        parts: PipelineParts,
    ) -> crate::orchestrator::RunRecord {
        let evidence = parts.evidence.clone();
        let plan = build_plan(config, parts).unwrap();
        let orchestrator = Orchestrator::new(
            plan,
            fast_executor(),
            HealthChecker::new(vec![], Duration::from_millis(50)),
            evidence,
        );
        orchestrator
            .run(Arc::new(RunToken::new()), Uuid::new_v4())
            .await
    }

    #[tokio::test]
    async fn test_full_pipeline_end_to_end() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let store = Arc::new(DedupStore::open_in_memory().await.unwrap());
        let objects = Arc::new(MemoryObjectStore::new());
        let driver = Arc::new(RecordingDriver::new());
        let evidence = Arc::new(EvidenceLog::new(Uuid::new_v4()));

        let run = run_pipeline(
            &config,
            PipelineParts {
                source: Arc::new(StaticSource {
                    records: vec![record(1), record(2)],
                }),
                store: store.clone(),
                sync: Some(Arc::new(SyncClient::new(objects.clone(), fast_executor()))),
                driver: Some(driver.clone()),
                evidence,
            },
        )
        .await;

        assert_eq!(run.overall, RunStatus::Success);
        assert_eq!(store.fetch_all().await.unwrap().len(), 2);
        // Report and evidence log both landed remotely.
        assert_eq!(objects.len(), 2);
        assert_eq!(driver.submissions.lock().len(), 1);
        assert!(config.report_dir.join(ReportRenderer::artifact_name(Utc::now().date_naive())).exists());
    }

    #[tokio::test]
    async fn test_pipeline_without_remote_or_form_still_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let store = Arc::new(DedupStore::open_in_memory().await.unwrap());
        let evidence = Arc::new(EvidenceLog::new(Uuid::new_v4()));

        let run = run_pipeline(
            &config,
            PipelineParts {
                source: Arc::new(StaticSource {
                    records: vec![record(1)],
                }),
                store,
                sync: None,
                driver: None,
                evidence,
            },
        )
        .await;

        assert_eq!(run.overall, RunStatus::Success);
        assert_eq!(run.step(StepId::UploadReport).unwrap().status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_rerun_skips_duplicates_and_daily_submission() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let store = Arc::new(DedupStore::open_in_memory().await.unwrap());
        let driver = Arc::new(RecordingDriver::new());

        for _ in 0..2 {
            let run = run_pipeline(
                &config,
                PipelineParts {
                    source: Arc::new(StaticSource {
                        records: vec![record(1), record(2)],
                    }),
                    store: store.clone(),
                    sync: None,
                    driver: Some(driver.clone()),
                    evidence: Arc::new(EvidenceLog::new(Uuid::new_v4())),
                },
            )
            .await;
            assert_eq!(run.overall, RunStatus::Success);
        }

        // Second run persisted nothing new and did not re-submit the form.
        assert_eq!(store.fetch_all().await.unwrap().len(), 2);
        assert_eq!(driver.submissions.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_source_aborts_pipeline() {
        struct DownSource;

        #[async_trait]
        impl CatalogSource for DownSource {
            async fn fetch(&self) -> Result<Vec<CatalogRecord>, StepError> {
                Err(StepError::fatal("authentication rejected"))
            }
        }

        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let run = run_pipeline(
            &config,
            PipelineParts {
                source: Arc::new(DownSource),
                store: Arc::new(DedupStore::open_in_memory().await.unwrap()),
                sync: None,
                driver: None,
                evidence: Arc::new(EvidenceLog::new(Uuid::new_v4())),
            },
        )
        .await;

        assert_eq!(run.overall, RunStatus::Aborted);
        assert_eq!(run.step(StepId::FetchCatalog).unwrap().status, StepStatus::Failed);
        assert_eq!(run.step(StepId::PersistRecords).unwrap().status, StepStatus::Skipped);
        assert_eq!(run.step(StepId::RenderReport).unwrap().status, StepStatus::Skipped);
    }

    #[test]
    fn test_remote_object_path_joins_prefix_and_name() {
        let path = remote_object_path("/reports/", Path::new("/tmp/out/catalog_report_2025-03-09.json")).unwrap();
        assert_eq!(path, "reports/catalog_report_2025-03-09.json");
    }
}
