//! The sequential step state machine.
//!
//! One logical driver executes the plan in declared order. Transitions:
//! `Pending -> Running -> {Success, Failed, Skipped}`. A step runs only when
//! every dependency succeeded; a failed critical step aborts the run and
//! skips everything still pending; a failed optional step is recorded and
//! the run continues. The orchestrator is the sole mutator of step and run
//! records.

use super::plan::RunPlan;
use super::result::{RunRecord, RunStatus, StepResult, StepStatus};
use super::step::{Criticality, StepId};
use crate::cancellation::RunToken;
use crate::evidence::EvidenceLog;
use crate::health::HealthChecker;
use crate::retry::{GiveUpReason, RetryExecutor};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Drives a validated [`RunPlan`] to a finalized [`RunRecord`].
pub struct Orchestrator {
    plan: RunPlan,
    executor: RetryExecutor,
    health: HealthChecker,
    evidence: Arc<EvidenceLog>,
    run_timeout: Option<Duration>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("plan", &self.plan)
            .field("executor", &self.executor)
            .field("health", &self.health)
            .field("run_timeout", &self.run_timeout)
            .finish()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over the given plan and collaborators.
    #[must_use]
    pub fn new(
        plan: RunPlan,
        executor: RetryExecutor,
        health: HealthChecker,
        evidence: Arc<EvidenceLog>,
    ) -> Self {
        Self {
            plan,
            executor,
            health,
            evidence,
            run_timeout: None,
        }
    }

    /// Configures a run-level timeout; on expiry the shared token is
    /// cancelled, the in-flight step fails as cancelled and the rest of the
    /// plan is skipped.
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Executes the plan and returns the finalized run record.
    pub async fn run(&self, token: Arc<RunToken>, run_id: Uuid) -> RunRecord {
        let started_at = Utc::now();
        let mut results: Vec<StepResult> = self
            .plan
            .steps()
            .iter()
            .map(|step| StepResult::pending(step.id))
            .collect();

        tracing::info!(%run_id, steps = self.plan.len(), "run started");

        let gate = self.health.check().await;
        if gate.is_healthy() {
            self.evidence
                .record_step("health-gate", true, serde_json::json!({ "ok": gate.ok }));
        } else {
            tracing::error!(failing = %gate.failure_summary(), "health gate failed; run aborted");
            self.evidence.record_step(
                "health-gate",
                false,
                serde_json::json!({ "failing": gate.failing }),
            );
            let now = Utc::now();
            for result in &mut results {
                result.status = StepStatus::Skipped;
                result.finished_at = Some(now);
            }
            return self.finalize(run_id, started_at, results, RunStatus::Aborted);
        }

        let watchdog = self.run_timeout.map(|timeout| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel(format!("run timeout after {}s", timeout.as_secs()));
            })
        });

        let mut statuses: HashMap<StepId, StepStatus> = HashMap::new();
        let mut aborted = false;

        for (index, step) in self.plan.steps().iter().enumerate() {
            let result = &mut results[index];

            if token.is_cancelled() {
                aborted = true;
            }
            if aborted {
                result.status = StepStatus::Skipped;
                result.finished_at = Some(Utc::now());
                statuses.insert(step.id, StepStatus::Skipped);
                tracing::warn!(step = %step.id, "step skipped: run no longer progressing");
                self.evidence.record_step(
                    step.id.name(),
                    false,
                    serde_json::json!({ "skipped": "run aborted" }),
                );
                continue;
            }

            let unmet: Vec<String> = step
                .depends_on
                .iter()
                .filter(|dep| statuses.get(*dep).copied() != Some(StepStatus::Success))
                .map(ToString::to_string)
                .collect();
            if !unmet.is_empty() {
                result.status = StepStatus::Skipped;
                result.finished_at = Some(Utc::now());
                statuses.insert(step.id, StepStatus::Skipped);
                tracing::warn!(step = %step.id, ?unmet, "step skipped: unmet dependencies");
                self.evidence.record_step(
                    step.id.name(),
                    false,
                    serde_json::json!({ "skipped": "unmet dependencies", "dependencies": unmet }),
                );
                continue;
            }

            result.status = StepStatus::Running;
            result.started_at = Some(Utc::now());
            tracing::info!(step = %step.id, criticality = %step.criticality, "step started");

            let action = Arc::clone(&step.action);
            let outcome = self
                .executor
                .execute(step.id.name(), &token, || {
                    let action = Arc::clone(&action);
                    let token = Arc::clone(&token);
                    async move { action.run(&token).await }
                })
                .await;

            match outcome {
                Ok(retried) => {
                    result.attempts = retried.attempts;
                    result.status = StepStatus::Success;
                    result.finished_at = Some(Utc::now());
                    statuses.insert(step.id, StepStatus::Success);
                    tracing::info!(step = %step.id, attempts = retried.attempts, "step succeeded");
                    self.evidence
                        .record_step(step.id.name(), true, retried.value.detail);
                }
                Err(failure) => {
                    let was_cancelled = failure.reason == GiveUpReason::Cancelled;
                    result.attempts = failure.attempts;
                    let error = failure.into_step_error();
                    tracing::error!(step = %step.id, attempts = result.attempts, error = %error, "step failed");
                    self.evidence.record_step(
                        step.id.name(),
                        false,
                        serde_json::json!({ "error": error.to_string() }),
                    );
                    result.last_error = Some(error);
                    result.status = StepStatus::Failed;
                    result.finished_at = Some(Utc::now());
                    statuses.insert(step.id, StepStatus::Failed);

                    if was_cancelled {
                        aborted = true;
                    } else if step.criticality == Criticality::Critical {
                        tracing::error!(step = %step.id, "critical step failed; aborting run");
                        aborted = true;
                    }
                }
            }
        }

        if let Some(handle) = watchdog {
            handle.abort();
        }

        let overall = if aborted {
            RunStatus::Aborted
        } else if results
            .iter()
            .any(|result| result.status != StepStatus::Success)
        {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };

        self.finalize(run_id, started_at, results, overall)
    }

    fn finalize(
        &self,
        run_id: Uuid,
        started_at: chrono::DateTime<Utc>,
        step_results: Vec<StepResult>,
        overall: RunStatus,
    ) -> RunRecord {
        let record = RunRecord {
            run_id,
            started_at,
            finished_at: Some(Utc::now()),
            step_results,
            overall,
        };

        let succeeded = record
            .step_results
            .iter()
            .filter(|result| result.status == StepStatus::Success)
            .count();
        tracing::info!(
            %run_id,
            status = %record.overall,
            succeeded,
            total = record.step_results.len(),
            duration_ms = record
                .duration()
                .map_or(0, |duration| duration.num_milliseconds()),
            "run finished"
        );
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, StepError};
    use crate::health::DependencyProbe;
    use crate::orchestrator::step::{StepAction, StepDescriptor, StepOutput};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted action: fails the first `failures` calls with the given
    /// kind, then succeeds. Counts invocations.
    struct ScriptedAction {
        failures: usize,
        kind: ErrorKind,
        calls: AtomicUsize,
    }

    impl ScriptedAction {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                failures: 0,
                kind: ErrorKind::Transient,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(kind: ErrorKind) -> Arc<Self> {
            Arc::new(Self {
                failures: usize::MAX,
                kind,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StepAction for ScriptedAction {
        async fn run(&self, _token: &RunToken) -> Result<StepOutput, StepError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(StepError::new(self.kind, "scripted failure"))
            } else {
                Ok(StepOutput::empty())
            }
        }
    }

    struct HangingAction;

    #[async_trait]
    impl StepAction for HangingAction {
        async fn run(&self, _token: &RunToken) -> Result<StepOutput, StepError> {
            std::future::pending().await
        }
    }

    fn fast_executor() -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy::new()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter_ratio(0.0),
        )
    }

    fn orchestrator(plan: RunPlan) -> Orchestrator {
        Orchestrator::new(
            plan,
            fast_executor(),
            HealthChecker::new(vec![], Duration::from_millis(50)),
            Arc::new(EvidenceLog::new(Uuid::new_v4())),
        )
    }

    async fn execute(orchestrator: &Orchestrator) -> RunRecord {
        orchestrator.run(Arc::new(RunToken::new()), Uuid::new_v4()).await
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let plan = RunPlan::new(vec![
            StepDescriptor::new(StepId::FetchCatalog, Criticality::Critical, ScriptedAction::succeeding()),
            StepDescriptor::new(StepId::PersistRecords, Criticality::Critical, ScriptedAction::succeeding())
                .depends_on(StepId::FetchCatalog),
        ])
        .unwrap();

        let record = execute(&orchestrator(plan)).await;
        assert_eq!(record.overall, RunStatus::Success);
        assert!(record
            .step_results
            .iter()
            .all(|result| result.status == StepStatus::Success));
    }

    #[tokio::test]
    async fn test_critical_failure_aborts_and_skips_rest() {
        // A(critical) -> B(critical, always failing) -> C(optional)
        let failing = ScriptedAction::failing(ErrorKind::Transient);
        let downstream = ScriptedAction::succeeding();
        let plan = RunPlan::new(vec![
            StepDescriptor::new(StepId::FetchCatalog, Criticality::Critical, ScriptedAction::succeeding()),
            StepDescriptor::new(StepId::PersistRecords, Criticality::Critical, failing.clone())
                .depends_on(StepId::FetchCatalog),
            StepDescriptor::new(StepId::RenderReport, Criticality::Optional, downstream.clone())
                .depends_on(StepId::PersistRecords),
        ])
        .unwrap();

        let record = execute(&orchestrator(plan)).await;

        assert_eq!(record.overall, RunStatus::Aborted);
        assert_eq!(record.step(StepId::FetchCatalog).unwrap().status, StepStatus::Success);
        assert_eq!(record.step(StepId::PersistRecords).unwrap().status, StepStatus::Failed);
        assert_eq!(record.step(StepId::RenderReport).unwrap().status, StepStatus::Skipped);
        // Exhausted the 2-attempt policy, then stopped.
        assert_eq!(failing.calls(), 2);
        assert_eq!(downstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_optional_failure_tolerated_as_partial() {
        // A(critical) -> B(optional, failing); C(critical) depends on A only.
        let optional = ScriptedAction::failing(ErrorKind::Transient);
        let tail = ScriptedAction::succeeding();
        let plan = RunPlan::new(vec![
            StepDescriptor::new(StepId::FetchCatalog, Criticality::Critical, ScriptedAction::succeeding()),
            StepDescriptor::new(StepId::UploadReport, Criticality::Optional, optional.clone())
                .depends_on(StepId::FetchCatalog),
            StepDescriptor::new(StepId::RecordEvidence, Criticality::Critical, tail.clone())
                .depends_on(StepId::FetchCatalog),
        ])
        .unwrap();

        let record = execute(&orchestrator(plan)).await;

        assert_eq!(record.overall, RunStatus::Partial);
        assert_eq!(record.step(StepId::UploadReport).unwrap().status, StepStatus::Failed);
        assert_eq!(record.step(StepId::RecordEvidence).unwrap().status, StepStatus::Success);
        assert_eq!(tail.calls(), 1);
    }

    #[tokio::test]
    async fn test_dependency_gating_never_runs_dependent_of_failed_step() {
        let failing = ScriptedAction::failing(ErrorKind::Validation);
        let gated = ScriptedAction::succeeding();
        let plan = RunPlan::new(vec![
            StepDescriptor::new(StepId::UploadReport, Criticality::Optional, failing),
            StepDescriptor::new(StepId::SubmitForm, Criticality::Optional, gated.clone())
                .depends_on(StepId::UploadReport),
        ])
        .unwrap();

        let record = execute(&orchestrator(plan)).await;

        assert_eq!(record.overall, RunStatus::Partial);
        assert_eq!(record.step(StepId::SubmitForm).unwrap().status, StepStatus::Skipped);
        assert_eq!(gated.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_retriable_failure_runs_single_attempt() {
        let failing = ScriptedAction::failing(ErrorKind::Validation);
        let plan = RunPlan::new(vec![StepDescriptor::new(
            StepId::FetchCatalog,
            Criticality::Critical,
            failing.clone(),
        )])
        .unwrap();

        let record = execute(&orchestrator(plan)).await;

        let result = record.step(StepId::FetchCatalog).unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(failing.calls(), 1);
        assert_eq!(result.last_error.as_ref().unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_transient_success_records_attempt_count() {
        let flaky = Arc::new(ScriptedAction {
            failures: 1,
            kind: ErrorKind::Transient,
            calls: AtomicUsize::new(0),
        });
        let plan = RunPlan::new(vec![StepDescriptor::new(
            StepId::FetchCatalog,
            Criticality::Critical,
            flaky,
        )])
        .unwrap();

        let record = execute(&orchestrator(plan)).await;
        let result = record.step(StepId::FetchCatalog).unwrap();
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_cancels_in_flight_step_and_skips_rest() {
        let tail = ScriptedAction::succeeding();
        let plan = RunPlan::new(vec![
            StepDescriptor::new(StepId::FetchCatalog, Criticality::Optional, Arc::new(HangingAction)),
            StepDescriptor::new(StepId::RecordEvidence, Criticality::Optional, tail.clone()),
        ])
        .unwrap();

        let orchestrator = orchestrator(plan).with_run_timeout(Some(Duration::from_millis(50)));
        let record = execute(&orchestrator).await;

        assert_eq!(record.overall, RunStatus::Aborted);
        let hung = record.step(StepId::FetchCatalog).unwrap();
        assert_eq!(hung.status, StepStatus::Failed);
        assert_eq!(hung.last_error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(record.step(StepId::RecordEvidence).unwrap().status, StepStatus::Skipped);
        assert_eq!(tail.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_health_gate_aborts_before_any_step() {
        struct DownProbe;

        #[async_trait]
        impl DependencyProbe for DownProbe {
            fn name(&self) -> &str {
                "store"
            }

            async fn probe(&self) -> Result<(), StepError> {
                Err(StepError::fatal("storage unavailable"))
            }
        }

        let action = ScriptedAction::succeeding();
        let plan = RunPlan::new(vec![StepDescriptor::new(
            StepId::FetchCatalog,
            Criticality::Critical,
            action.clone(),
        )])
        .unwrap();

        let orchestrator = Orchestrator::new(
            plan,
            fast_executor(),
            HealthChecker::new(vec![Arc::new(DownProbe)], Duration::from_millis(50)),
            Arc::new(EvidenceLog::new(Uuid::new_v4())),
        );
        let record = execute(&orchestrator).await;

        assert_eq!(record.overall, RunStatus::Aborted);
        assert_eq!(record.step(StepId::FetchCatalog).unwrap().status, StepStatus::Skipped);
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn test_evidence_records_every_step_outcome() {
        let evidence = Arc::new(EvidenceLog::new(Uuid::new_v4()));
        let plan = RunPlan::new(vec![
            StepDescriptor::new(StepId::FetchCatalog, Criticality::Critical, ScriptedAction::succeeding()),
            StepDescriptor::new(StepId::PersistRecords, Criticality::Optional, ScriptedAction::failing(ErrorKind::Conflict))
                .depends_on(StepId::FetchCatalog),
        ])
        .unwrap();

        let orchestrator = Orchestrator::new(
            plan,
            fast_executor(),
            HealthChecker::new(vec![], Duration::from_millis(50)),
            evidence.clone(),
        );
        execute(&orchestrator).await;

        // Health gate + both steps.
        assert_eq!(evidence.entry_count(), 3);
        let entries = evidence.entries();
        assert!(entries.iter().any(|entry| entry.stage == "fetch-catalog" && entry.success));
        assert!(entries.iter().any(|entry| entry.stage == "persist-records" && !entry.success));
    }
}
