//! Step graph validation: run this before publishing a version.
//!
//! Rules enforced:
//! 1. The version has at least one step and its start step exists.
//! 2. Step IDs are unique within the version.
//! 3. Every route (next step or branch target) references a known step.
//! 4. The directed graph is acyclic (topological sort must succeed).
//!
//! Returns the step IDs in a topological order on success.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{models::WorkflowVersion, EngineError};

/// Validate the version's step graph and return a topological order.
///
/// # Errors
/// - [`EngineError::EmptyWorkflow`] / [`EngineError::MissingStartStep`].
/// - [`EngineError::DuplicateStepId`] if two steps share an ID.
/// - [`EngineError::UnknownStepReference`] if a route targets a missing step.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn validate_dag(version: &WorkflowVersion) -> Result<Vec<String>, EngineError> {
    if version.steps.is_empty() {
        return Err(EngineError::EmptyWorkflow);
    }

    let mut step_ids: HashSet<&str> = HashSet::new();
    for step in &version.steps {
        if !step_ids.insert(step.id.as_str()) {
            return Err(EngineError::DuplicateStepId(step.id.clone()));
        }
    }
    if !step_ids.contains(version.start_step.as_str()) {
        return Err(EngineError::MissingStartStep(version.start_step.clone()));
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> =
        version.steps.iter().map(|s| (s.id.as_str(), 0)).collect();

    for step in &version.steps {
        let targets = adjacency.entry(step.id.as_str()).or_default();
        for target in step.successors() {
            if !step_ids.contains(target) {
                return Err(EngineError::UnknownStepReference {
                    step_id: step.id.clone(),
                    target: target.to_owned(),
                });
            }
            // Several outcomes may share a target; count the edge once.
            if !targets.contains(&target) {
                targets.push(target);
                *in_degree.entry(target).or_insert(0) += 1;
            }
        }
    }

    // Kahn's algorithm, seeded in declaration order for a stable result.
    let mut queue: VecDeque<&str> = version
        .steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(version.steps.len());
    while let Some(step_id) = queue.pop_front() {
        sorted.push(step_id.to_owned());
        for &next in adjacency.get(step_id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if sorted.len() != version.steps.len() {
        return Err(EngineError::CycleDetected);
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Routing, WorkflowStep};
    use db::models::PublicationStatus;
    use steps::StepConfig;
    use uuid::Uuid;

    fn step(id: &str, routing: Routing) -> WorkflowStep {
        WorkflowStep {
            id: id.into(),
            name: String::new(),
            config: StepConfig::Formula {
                formula_id: Uuid::nil(),
            },
            routing,
        }
    }

    fn next(step: &str) -> Routing {
        Routing::Next { step: step.into() }
    }

    fn branch(pairs: &[(&str, Option<&str>)]) -> Routing {
        Routing::Branch {
            outcomes: pairs
                .iter()
                .map(|(label, target)| (label.to_string(), target.map(str::to_owned)))
                .collect(),
        }
    }

    fn version(start: &str, steps: Vec<WorkflowStep>) -> WorkflowVersion {
        WorkflowVersion {
            id: Uuid::new_v4(),
            definition_id: Uuid::new_v4(),
            number: 1,
            status: PublicationStatus::Draft,
            start_step: start.into(),
            steps,
        }
    }

    #[test]
    fn linear_version_returns_sorted_order() {
        // a → b → c
        let v = version(
            "a",
            vec![step("a", next("b")), step("b", next("c")), step("c", Routing::Terminal)],
        );
        assert_eq!(validate_dag(&v).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn branches_form_a_diamond() {
        //     assess
        //    /      \
        // offer   review
        //    \      /
        //     close
        let v = version(
            "assess",
            vec![
                step(
                    "assess",
                    branch(&[("low", Some("offer")), ("high", Some("review")), ("no_match", None)]),
                ),
                step("offer", next("close")),
                step("review", branch(&[("approved", Some("close")), ("rejected", Some("close"))])),
                step("close", Routing::Terminal),
            ],
        );
        let sorted = validate_dag(&v).expect("should be valid");
        assert_eq!(sorted.first().map(String::as_str), Some("assess"));
        assert_eq!(sorted.last().map(String::as_str), Some("close"));
        assert_eq!(sorted.len(), 4);
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let v = version("a", vec![step("a", Routing::Terminal), step("a", Routing::Terminal)]);
        assert!(matches!(
            validate_dag(&v),
            Err(EngineError::DuplicateStepId(id)) if id == "a"
        ));
    }

    #[test]
    fn route_to_missing_step_is_rejected() {
        let v = version("a", vec![step("a", branch(&[("matched", Some("ghost"))]))]);
        assert!(matches!(
            validate_dag(&v),
            Err(EngineError::UnknownStepReference { target, .. }) if target == "ghost"
        ));
    }

    #[test]
    fn cycle_is_detected() {
        // a → b → c → a
        let v = version(
            "a",
            vec![step("a", next("b")), step("b", next("c")), step("c", next("a"))],
        );
        assert!(matches!(validate_dag(&v), Err(EngineError::CycleDetected)));
    }

    #[test]
    fn empty_or_headless_versions_are_rejected() {
        assert!(matches!(
            validate_dag(&version("a", vec![])),
            Err(EngineError::EmptyWorkflow)
        ));
        assert!(matches!(
            validate_dag(&version("start", vec![step("solo", Routing::Terminal)])),
            Err(EngineError::MissingStartStep(id)) if id == "start"
        ));
    }
}
