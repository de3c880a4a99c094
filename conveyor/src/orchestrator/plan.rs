//! Run plan: the validated, immutable set of declared steps.

use super::step::{StepDescriptor, StepId};
use crate::errors::PlanError;
use std::collections::{HashMap, HashSet};

/// A validated pipeline declaration, in execution order.
///
/// Validation guarantees unique identifiers, resolvable dependencies and an
/// acyclic graph whose declared order respects every dependency.
#[derive(Debug, Clone)]
pub struct RunPlan {
    steps: Vec<StepDescriptor>,
}

impl RunPlan {
    /// Validates the declared steps and fixes their order for the run.
    ///
    /// # Errors
    ///
    /// Returns a [`PlanError`] for duplicate steps, unknown dependencies,
    /// dependency cycles, or an empty declaration.
    pub fn new(steps: Vec<StepDescriptor>) -> Result<Self, PlanError> {
        if steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id) {
                return Err(PlanError::DuplicateStep(step.id.to_string()));
            }
        }

        let declared: HashMap<StepId, &StepDescriptor> =
            steps.iter().map(|step| (step.id, step)).collect();
        for step in &steps {
            for dependency in &step.depends_on {
                if !declared.contains_key(dependency) {
                    return Err(PlanError::UnknownDependency {
                        step: step.id.to_string(),
                        dependency: dependency.to_string(),
                    });
                }
            }
        }

        detect_cycles(&steps, &declared)?;

        // Declared order must already satisfy the dependency relation; the
        // sequential driver executes in exactly this order.
        let mut completed: HashSet<StepId> = HashSet::new();
        for step in &steps {
            if let Some(dependency) = step.depends_on.iter().find(|d| !completed.contains(*d)) {
                return Err(PlanError::UnknownDependency {
                    step: step.id.to_string(),
                    dependency: format!("{dependency} (declared after its dependent)"),
                });
            }
            completed.insert(step.id);
        }

        Ok(Self { steps })
    }

    /// The declared steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    /// Number of declared steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan is empty (never true for a validated plan).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Restricts the plan to the requested identifiers, preserving declared
    /// order.
    ///
    /// # Errors
    ///
    /// Returns a [`PlanError`] when an identifier is not declared or the
    /// selection omits a dependency of a selected step.
    pub fn subset(&self, requested: &[StepId]) -> Result<Self, PlanError> {
        if requested.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let declared: HashSet<StepId> = self.steps.iter().map(|step| step.id).collect();
        for id in requested {
            if !declared.contains(id) {
                return Err(PlanError::UnknownStep(id.to_string()));
            }
        }

        let selected: HashSet<StepId> = requested.iter().copied().collect();
        for step in self.steps.iter().filter(|step| selected.contains(&step.id)) {
            for dependency in &step.depends_on {
                if !selected.contains(dependency) {
                    return Err(PlanError::MissingDependency {
                        step: step.id.to_string(),
                        dependency: dependency.to_string(),
                    });
                }
            }
        }

        let steps = self
            .steps
            .iter()
            .filter(|step| selected.contains(&step.id))
            .cloned()
            .collect();
        Ok(Self { steps })
    }
}

/// Depth-first cycle detection over the declared dependency graph.
fn detect_cycles(
    steps: &[StepDescriptor],
    declared: &HashMap<StepId, &StepDescriptor>,
) -> Result<(), PlanError> {
    fn visit(
        node: StepId,
        declared: &HashMap<StepId, &StepDescriptor>,
        visited: &mut HashSet<StepId>,
        in_progress: &mut Vec<StepId>,
    ) -> Result<(), PlanError> {
        if visited.contains(&node) {
            return Ok(());
        }
        if let Some(position) = in_progress.iter().position(|id| *id == node) {
            let mut cycle_path: Vec<String> =
                in_progress[position..].iter().map(ToString::to_string).collect();
            cycle_path.push(node.to_string());
            return Err(PlanError::CycleDetected { cycle_path });
        }

        in_progress.push(node);
        if let Some(step) = declared.get(&node) {
            let mut dependencies: Vec<StepId> = step.depends_on.iter().copied().collect();
            dependencies.sort();
            for dependency in dependencies {
                visit(dependency, declared, visited, in_progress)?;
            }
        }
        in_progress.pop();
        visited.insert(node);
        Ok(())
    }

    let mut visited = HashSet::new();
    let mut in_progress = Vec::new();
    for step in steps {
        visit(step.id, declared, &mut visited, &mut in_progress)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::RunToken;
    use crate::errors::StepError;
    use crate::orchestrator::step::{Criticality, StepAction, StepOutput};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl StepAction for Noop {
        async fn run(&self, _token: &RunToken) -> Result<StepOutput, StepError> {
            Ok(StepOutput::empty())
        }
    }

    fn step(id: StepId) -> StepDescriptor {
        StepDescriptor::new(id, Criticality::Critical, Arc::new(Noop))
    }

    fn chain() -> Vec<StepDescriptor> {
        vec![
            step(StepId::FetchCatalog),
            step(StepId::PersistRecords).depends_on(StepId::FetchCatalog),
            step(StepId::RenderReport).depends_on(StepId::PersistRecords),
        ]
    }

    #[test]
    fn test_valid_chain_accepted() {
        let plan = RunPlan::new(chain()).unwrap();
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_empty_plan_rejected() {
        assert!(matches!(RunPlan::new(vec![]), Err(PlanError::EmptyPlan)));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let steps = vec![step(StepId::FetchCatalog), step(StepId::FetchCatalog)];
        assert!(matches!(RunPlan::new(steps), Err(PlanError::DuplicateStep(_))));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let steps = vec![step(StepId::PersistRecords).depends_on(StepId::FetchCatalog)];
        assert!(matches!(
            RunPlan::new(steps),
            Err(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let steps = vec![
            step(StepId::FetchCatalog).depends_on(StepId::RenderReport),
            step(StepId::PersistRecords).depends_on(StepId::FetchCatalog),
            step(StepId::RenderReport).depends_on(StepId::PersistRecords),
        ];
        let err = RunPlan::new(steps).unwrap_err();
        assert!(matches!(err, PlanError::CycleDetected { .. }));
    }

    #[test]
    fn test_declaration_order_must_respect_dependencies() {
        let steps = vec![
            step(StepId::PersistRecords).depends_on(StepId::FetchCatalog),
            step(StepId::FetchCatalog),
        ];
        assert!(RunPlan::new(steps).is_err());
    }

    #[test]
    fn test_subset_preserves_declared_order() {
        let plan = RunPlan::new(chain()).unwrap();
        let subset = plan
            .subset(&[StepId::PersistRecords, StepId::FetchCatalog])
            .unwrap();

        let ids: Vec<StepId> = subset.steps().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![StepId::FetchCatalog, StepId::PersistRecords]);
    }

    #[test]
    fn test_subset_missing_dependency_rejected() {
        let plan = RunPlan::new(chain()).unwrap();
        let err = plan.subset(&[StepId::RenderReport]).unwrap_err();
        assert!(matches!(err, PlanError::MissingDependency { .. }));
    }

    #[test]
    fn test_subset_unknown_step_rejected() {
        let plan = RunPlan::new(vec![step(StepId::FetchCatalog)]).unwrap();
        let err = plan.subset(&[StepId::SubmitForm]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownStep(_)));
    }
}
