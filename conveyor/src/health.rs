//! Pre-flight verification of external dependencies.
//!
//! Each dependency gets one lightweight probe under a short timeout. Probes
//! are never retried; the orchestrator gates the run on the aggregate
//! report.

use crate::errors::{classify_http_status, classify_transport_error, StepError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A single dependency probe.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    /// The dependency name reported in the health report.
    fn name(&self) -> &str;

    /// Performs one lightweight check.
    async fn probe(&self) -> Result<(), StepError>;
}

/// Aggregate result of a health check pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    /// Dependencies that answered their probe.
    pub ok: Vec<String>,
    /// Failing dependencies with the failure reason.
    pub failing: BTreeMap<String, String>,
}

impl HealthReport {
    /// Returns true when no dependency is failing.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.failing.is_empty()
    }

    /// Renders the failing set as a single summary line.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        self.failing
            .iter()
            .map(|(name, reason)| format!("{name}: {reason}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Runs every registered probe once with a per-probe timeout.
pub struct HealthChecker {
    probes: Vec<Arc<dyn DependencyProbe>>,
    probe_timeout: Duration,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("probes", &self.probes.len())
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

impl HealthChecker {
    /// Creates a checker over the given probes.
    #[must_use]
    pub fn new(probes: Vec<Arc<dyn DependencyProbe>>, probe_timeout: Duration) -> Self {
        Self {
            probes,
            probe_timeout,
        }
    }

    /// Probes every dependency once. A timed-out or failing probe is
    /// reported once, never retried.
    pub async fn check(&self) -> HealthReport {
        let mut report = HealthReport::default();

        for probe in &self.probes {
            let name = probe.name().to_string();
            match tokio::time::timeout(self.probe_timeout, probe.probe()).await {
                Ok(Ok(())) => {
                    tracing::debug!(dependency = %name, "probe ok");
                    report.ok.push(name);
                }
                Ok(Err(err)) => {
                    tracing::warn!(dependency = %name, error = %err, "probe failed");
                    report.failing.insert(name, err.to_string());
                }
                Err(_) => {
                    tracing::warn!(dependency = %name, "probe timed out");
                    report.failing.insert(
                        name,
                        format!("probe timed out after {:?}", self.probe_timeout),
                    );
                }
            }
        }

        report
    }
}

/// Probe that issues a `GET` against an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct EndpointProbe {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl EndpointProbe {
    /// Creates a probe for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StepError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StepError::fatal(format!("http client construction failed: {e}")))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl DependencyProbe for EndpointProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), StepError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(classify_http_status(status, &self.url))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProbe {
        name: &'static str,
        outcome: Result<(), StepError>,
    }

    #[async_trait]
    impl DependencyProbe for StaticProbe {
        fn name(&self) -> &str {
            self.name
        }

        async fn probe(&self) -> Result<(), StepError> {
            self.outcome.clone()
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl DependencyProbe for HangingProbe {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn probe(&self) -> Result<(), StepError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_empty_checker_is_healthy() {
        let checker = HealthChecker::new(vec![], Duration::from_millis(50));
        assert!(checker.check().await.is_healthy());
    }

    #[tokio::test]
    async fn test_reports_ok_and_failing_by_name() {
        let checker = HealthChecker::new(
            vec![
                Arc::new(StaticProbe {
                    name: "store",
                    outcome: Ok(()),
                }),
                Arc::new(StaticProbe {
                    name: "endpoint",
                    outcome: Err(StepError::fatal("authentication rejected")),
                }),
            ],
            Duration::from_millis(50),
        );

        let report = checker.check().await;
        assert!(!report.is_healthy());
        assert_eq!(report.ok, vec!["store".to_string()]);
        assert!(report.failing["endpoint"].contains("authentication rejected"));
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out_once() {
        let checker = HealthChecker::new(vec![Arc::new(HangingProbe)], Duration::from_millis(10));

        let report = checker.check().await;
        assert!(!report.is_healthy());
        assert!(report.failing["hanging"].contains("timed out"));
    }

    #[test]
    fn test_failure_summary_joins_entries() {
        let mut report = HealthReport::default();
        report.failing.insert("a".to_string(), "down".to_string());
        report.failing.insert("b".to_string(), "slow".to_string());
        assert_eq!(report.failure_summary(), "a: down; b: slow");
    }
}
