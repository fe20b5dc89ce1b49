//! Dependency resolution over the plan DAG.

use crate::error::EngineError;
use crate::plan::{Plan, PlanStep};
use crate::state::{ExecutionState, StepStatus};

/// Steps that may start now, paired with their index in the plan.
///
/// A step is ready when it is pending and every dependency is completed. An
/// empty dependency list is trivially ready. Pure with respect to `state`.
pub fn ready<'a>(plan: &'a Plan, state: &ExecutionState) -> Vec<(usize, &'a PlanStep)> {
	plan
		.steps
		.iter()
		.enumerate()
		.filter(|(_, step)| state.step_status(&step.id) == StepStatus::Pending)
		.filter(|(_, step)| {
			step
				.dependencies
				.iter()
				.all(|dep| state.step_status(dep) == StepStatus::Completed && plan.step(dep).is_some())
		})
		.collect()
}

/// Check that an empty ready set is explained by the plan being finished.
///
/// Returns `PLAN_CIRCULAR_DEPENDENCY` when unfinished steps remain but none
/// can start: a cycle or a dependency on a step that will never complete.
pub fn ensure_progress(state: &ExecutionState) -> Result<(), EngineError> {
	let unfinished = state.unfinished_steps();
	if unfinished.is_empty() {
		Ok(())
	} else {
		Err(EngineError::circular_dependency(&unfinished))
	}
}
