//! Step identity, criticality and the step action contract.

use crate::cancellation::RunToken;
use crate::errors::{PlanError, StepError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// The closed set of pipeline step identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    /// Fetch the catalog from the remote API.
    FetchCatalog,
    /// Persist fetched records without duplication.
    PersistRecords,
    /// Render the dated report artifact.
    RenderReport,
    /// Upload the report to the remote store.
    UploadReport,
    /// Submit the confirmation form.
    SubmitForm,
    /// Save the evidence log (and push it remotely when configured).
    RecordEvidence,
}

impl StepId {
    /// All step identifiers in declared pipeline order.
    #[must_use]
    pub fn all() -> [Self; 6] {
        [
            Self::FetchCatalog,
            Self::PersistRecords,
            Self::RenderReport,
            Self::UploadReport,
            Self::SubmitForm,
            Self::RecordEvidence,
        ]
    }

    /// The identifier's CLI-facing name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::FetchCatalog => "fetch-catalog",
            Self::PersistRecords => "persist-records",
            Self::RenderReport => "render-report",
            Self::UploadReport => "upload-report",
            Self::SubmitForm => "submit-form",
            Self::RecordEvidence => "record-evidence",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for StepId {
    type Err = PlanError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|id| id.name() == raw.trim())
            .ok_or_else(|| PlanError::UnknownStep(raw.trim().to_string()))
    }
}

/// Whether a step's failure aborts the run or is tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure aborts the run; remaining steps are skipped.
    Critical,
    /// Failure is recorded and the run continues.
    Optional,
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::Optional => write!(f, "optional"),
        }
    }
}

/// Successful step output: free-form detail recorded as evidence.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Metadata describing what the step did.
    pub detail: serde_json::Value,
}

impl StepOutput {
    /// An output with no detail.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// An output carrying the given detail.
    #[must_use]
    pub fn with_detail(detail: serde_json::Value) -> Self {
        Self { detail }
    }
}

/// One unit of pipeline work.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Performs the step once. The retry layer decides whether failed
    /// attempts are repeated.
    async fn run(&self, token: &RunToken) -> Result<StepOutput, StepError>;
}

/// A declared step: identity, criticality, dependencies, action.
#[derive(Clone)]
pub struct StepDescriptor {
    /// Step identity.
    pub id: StepId,
    /// Whether failure aborts the run.
    pub criticality: Criticality,
    /// Steps that must reach success first.
    pub depends_on: HashSet<StepId>,
    /// The work itself.
    pub action: Arc<dyn StepAction>,
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("id", &self.id)
            .field("criticality", &self.criticality)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

impl StepDescriptor {
    /// Creates a descriptor with no dependencies.
    #[must_use]
    pub fn new(id: StepId, criticality: Criticality, action: Arc<dyn StepAction>) -> Self {
        Self {
            id,
            criticality,
            depends_on: HashSet::new(),
            action,
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: StepId) -> Self {
        self.depends_on.insert(id);
        self
    }
}
