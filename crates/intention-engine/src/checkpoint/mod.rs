//! Checkpoints and resume-time drift detection.
//!
//! A checkpoint pins the orchestrator version and the schema versions of
//! the tools a plan uses at the moment the execution was suspended. On
//! resume the pinned versions are compared with the running ones; when they
//! differ, the remaining steps are replayed through the [`ShadowSimulator`]
//! and the share of steps that would no longer go through decides whether
//! the execution may continue.

mod simulation;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use simulation::{ShadowSimulator, Simulated};

use crate::state::{ExecutionState, StepExecutionState, StepStatus};
use crate::tools::ToolRegistry;

/// Versions pinned when an execution is suspended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMeta {
	pub orchestrator_version: String,
	/// Tool name -> schema version, for the tools of the checkpointed plan
	pub tool_schema_versions: BTreeMap<String, String>,
	pub plan_version: u32,
	/// Steps that had not completed when the checkpoint was taken
	pub pending_steps: Vec<String>,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResumeRecommendation {
	SafeToResume,
	ReviewRequired,
	BlockResume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergentStep {
	pub step_id: String,
	pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
	/// Any pinned version differs from the running one
	pub drifted: bool,
	pub orchestrator_version_changed: bool,
	pub changed_tools: Vec<String>,
	pub simulated_steps: usize,
	pub divergent_steps: Vec<DivergentStep>,
	pub divergence_pct: f64,
	pub recommendation: ResumeRecommendation,
	pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriftConfig {
	/// Divergence at or above this percentage requires review
	pub review_threshold_pct: f64,
	/// Divergence at or above this percentage blocks the resume
	pub block_threshold_pct: f64,
}

impl Default for DriftConfig {
	fn default() -> Self {
		Self {
			review_threshold_pct: 20.0,
			block_threshold_pct: 50.0,
		}
	}
}

impl DriftConfig {
	pub fn recommend(&self, divergence_pct: f64) -> ResumeRecommendation {
		if divergence_pct >= self.block_threshold_pct {
			ResumeRecommendation::BlockResume
		} else if divergence_pct >= self.review_threshold_pct {
			ResumeRecommendation::ReviewRequired
		} else {
			ResumeRecommendation::SafeToResume
		}
	}
}

pub struct CheckpointManager {
	orchestrator_version: String,
	registry: Arc<ToolRegistry>,
	config: DriftConfig,
}

impl CheckpointManager {
	pub fn new(
		orchestrator_version: impl Into<String>,
		registry: Arc<ToolRegistry>,
		config: DriftConfig,
	) -> Self {
		Self {
			orchestrator_version: orchestrator_version.into(),
			registry,
			config,
		}
	}

	pub fn capture(&self, state: &ExecutionState) -> CheckpointMeta {
		CheckpointMeta {
			orchestrator_version: self.orchestrator_version.clone(),
			tool_schema_versions: self.registry.schema_versions(&state.plan),
			plan_version: state.plan.version,
			pending_steps: state
				.plan
				.steps
				.iter()
				.filter(|s| state.step_status(&s.id) != StepStatus::Completed)
				.map(|s| s.id.clone())
				.collect(),
			created_at: Utc::now(),
		}
	}

	/// Compare the state's checkpoint with the running versions. Returns
	/// `None` when the state carries no checkpoint.
	pub fn detect_drift(&self, state: &ExecutionState) -> Option<DriftReport> {
		let checkpoint = state.checkpoint.as_ref()?;
		let orchestrator_version_changed = checkpoint.orchestrator_version != self.orchestrator_version;
		let current = self.registry.schema_versions(&state.plan);
		let changed_tools: Vec<String> = state
			.plan
			.tool_names()
			.into_iter()
			.filter(|tool| checkpoint.tool_schema_versions.get(*tool) != current.get(*tool))
			.map(str::to_string)
			.collect();
		let drifted = orchestrator_version_changed || !changed_tools.is_empty();

		let (simulated_steps, divergent_steps) = if drifted {
			self.simulate(state)
		} else {
			(0, Vec::new())
		};
		let divergence_pct = if simulated_steps == 0 {
			0.0
		} else {
			divergent_steps.len() as f64 * 100.0 / simulated_steps as f64
		};
		let recommendation = self.config.recommend(divergence_pct);

		if drifted {
			warn!(
				execution_id = %state.execution_id,
				orchestrator_version_changed,
				changed_tools = ?changed_tools,
				divergence_pct,
				recommendation = ?recommendation,
				"version drift detected on resume"
			);
		} else {
			info!(execution_id = %state.execution_id, "no version drift since checkpoint");
		}

		Some(DriftReport {
			drifted,
			orchestrator_version_changed,
			changed_tools,
			simulated_steps,
			divergent_steps,
			divergence_pct,
			recommendation,
			evaluated_at: Utc::now(),
		})
	}

	/// Replay every not-yet-completed step in dependency order on a scratch
	/// copy of the state.
	fn simulate(&self, state: &ExecutionState) -> (usize, Vec<DivergentStep>) {
		let simulator = ShadowSimulator::new(&self.registry);
		let mut shadow = state.clone();
		let mut remaining: Vec<_> = state
			.plan
			.steps
			.iter()
			.filter(|s| !matches!(state.step_status(&s.id), StepStatus::Completed | StepStatus::Skipped))
			.collect();
		let simulated = remaining.len();
		let mut divergent = Vec::new();
		let mut diverged_ids = HashSet::new();

		loop {
			let (runnable, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|step| {
				step
					.dependencies
					.iter()
					.all(|dep| shadow.step_status(dep) == StepStatus::Completed)
			});
			if runnable.is_empty() {
				remaining = blocked;
				break;
			}
			for step in runnable {
				match simulator.simulate(step, &shadow) {
					Simulated::Completed(output) => {
						*shadow.ensure_step_state(&step.id) = StepExecutionState {
							status: StepStatus::Completed,
							output: Some(output),
							..StepExecutionState::pending(&step.id)
						};
					},
					Simulated::Diverged(reason) => {
						diverged_ids.insert(step.id.clone());
						divergent.push(DivergentStep {
							step_id: step.id.clone(),
							reason,
						});
					},
				}
			}
			remaining = blocked;
		}

		for step in remaining {
			let reason = match step.dependencies.iter().find(|d| diverged_ids.contains(*d)) {
				Some(dep) => format!("depends on diverged step '{dep}'"),
				None => "dependencies can never complete".to_string(),
			};
			divergent.push(DivergentStep {
				step_id: step.id.clone(),
				reason,
			});
		}
		(simulated, divergent)
	}
}
