//! Parallel batch coordinator.
//!
//! The [`Orchestrator`] owns the main control loop of an execution. Each
//! iteration asks the resolver for ready steps, runs them concurrently
//! through the step executor, persists the state once, and then decides at
//! the batch boundary whether to continue, pause for confirmation, repair,
//! compensate, checkpoint or finish. Step failures never abort a batch:
//! siblings always run to completion.

mod result;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, error, info, warn};

pub use result::ExecutionResult;

use crate::breaker::cost::CostCircuitBreaker;
use crate::breaker::{CircuitBreakerRegistry, CircuitStore, InMemoryCircuitStore, KvCircuitStore};
use crate::checkpoint::{CheckpointManager, ResumeRecommendation};
use crate::compensation::{CompensationEngine, CompensationRegistry};
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorCode};
use crate::executor::StepExecutor;
use crate::idempotency::{IdempotencyService, StoreIdempotencyService};
use crate::plan::{Plan, PlanStep};
use crate::planner::{LocationContext, PlanRequest, Planner, PlannerError};
use crate::repair::{RepairOutcome, SelfRepairLoop};
use crate::resolver;
use crate::state::{ExecutionFailure, ExecutionState, ExecutionStatus, StepStatus};
use crate::stateful::{ExecutionStore, KvExecutionStore, MemoryStore, StateStore};
use crate::tools::{ToolExecutor, ToolRegistry};

/// What a caller asks the engine to do.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
	/// Reusing an id resumes the existing execution instead of starting over
	pub execution_id: Option<String>,
	pub intent: String,
	pub user_id: Option<String>,
	pub location: Option<LocationContext>,
	/// Initial execution context (user preferences, intent constraints)
	pub context: Option<Value>,
}

impl ExecutionRequest {
	pub fn new(intent: impl Into<String>) -> Self {
		Self {
			intent: intent.into(),
			..Default::default()
		}
	}

	pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
		self.execution_id = Some(execution_id.into());
		self
	}

	pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());
		self
	}

	pub fn with_location(mut self, location: LocationContext) -> Self {
		self.location = Some(location);
		self
	}

	pub fn with_context(mut self, context: Value) -> Self {
		self.context = Some(context);
		self
	}

	fn plan_request(&self) -> PlanRequest {
		PlanRequest {
			intent: self.intent.clone(),
			user_location: self.location,
			user_id: self.user_id.clone(),
		}
	}

	fn into_state(self, plan: Plan) -> ExecutionState {
		let execution_id = self
			.execution_id
			.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
		let mut context = match self.context {
			Some(Value::Object(map)) => map,
			_ => Default::default(),
		};
		if let Some(location) = self.location {
			context.insert(
				"location".to_string(),
				serde_json::json!({ "lat": location.lat, "lng": location.lng }),
			);
		}
		let mut state = ExecutionState::new(execution_id, plan).with_context(Value::Object(context));
		state.user_id = self.user_id;
		state.intent = Some(self.intent);
		state
	}
}

/// Drives executions from plan to a terminal or suspended state.
pub struct Orchestrator {
	config: EngineConfig,
	planner: Arc<dyn Planner>,
	store: Arc<dyn ExecutionStore>,
	executor: StepExecutor,
	repair: SelfRepairLoop,
	compensation: CompensationEngine,
	checkpoints: CheckpointManager,
}

pub struct OrchestratorBuilder {
	config: EngineConfig,
	tools: Arc<dyn ToolExecutor>,
	planner: Arc<dyn Planner>,
	registry: Option<ToolRegistry>,
	compensations: Option<CompensationRegistry>,
	state_store: Option<Arc<dyn StateStore>>,
	execution_store: Option<Arc<dyn ExecutionStore>>,
	breakers: Option<Arc<CircuitBreakerRegistry>>,
	idempotency: Option<Arc<dyn IdempotencyService>>,
	cost: Option<Arc<CostCircuitBreaker>>,
}

impl OrchestratorBuilder {
	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	/// Tool definitions; defaults to the tools listed in the config.
	pub fn with_tool_registry(mut self, registry: ToolRegistry) -> Self {
		self.registry = Some(registry);
		self
	}

	/// Undo actions; defaults to the compensations listed in the config.
	pub fn with_compensations(mut self, compensations: CompensationRegistry) -> Self {
		self.compensations = Some(compensations);
		self
	}

	/// Key-value store shared by execution persistence, idempotency records,
	/// circuit state and the cost ledger.
	pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
		self.state_store = Some(store);
		self
	}

	pub fn with_execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
		self.execution_store = Some(store);
		self
	}

	pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
		self.breakers = Some(breakers);
		self
	}

	pub fn with_idempotency(mut self, idempotency: Arc<dyn IdempotencyService>) -> Self {
		self.idempotency = Some(idempotency);
		self
	}

	pub fn with_cost_breaker(mut self, cost: Arc<CostCircuitBreaker>) -> Self {
		self.cost = Some(cost);
		self
	}

	pub fn build(self) -> Orchestrator {
		let config = self.config;
		let registry = Arc::new(self.registry.unwrap_or_else(|| config.tool_registry()));
		let compensations = Arc::new(
			self
				.compensations
				.unwrap_or_else(|| config.compensation_registry()),
		);

		let circuit_store: Arc<dyn CircuitStore> = match &self.state_store {
			Some(store) => Arc::new(KvCircuitStore::new(store.clone())),
			None => Arc::new(InMemoryCircuitStore::new()),
		};
		let state_store: Arc<dyn StateStore> = self
			.state_store
			.unwrap_or_else(|| Arc::new(MemoryStore::new()));
		let store = self
			.execution_store
			.unwrap_or_else(|| Arc::new(KvExecutionStore::new(state_store.clone())));
		let idempotency = self.idempotency.unwrap_or_else(|| {
			Arc::new(StoreIdempotencyService::new(
				state_store.clone(),
				config.idempotency_ttl(),
			))
		});
		let breakers = self
			.breakers
			.unwrap_or_else(|| Arc::new(CircuitBreakerRegistry::new(circuit_store, config.breaker.clone())));
		let cost = self
			.cost
			.unwrap_or_else(|| Arc::new(CostCircuitBreaker::new(state_store.clone(), config.cost.clone())));

		let executor = StepExecutor::new(
			self.tools.clone(),
			registry.clone(),
			breakers,
			cost,
			idempotency,
		)
		.with_guardrails(config.guardrails.clone())
		.with_default_timeout(config.default_step_timeout());

		Orchestrator {
			repair: SelfRepairLoop::new(self.planner.clone(), config.repair.clone()),
			compensation: CompensationEngine::new(
				compensations,
				self.tools,
				registry.clone(),
				config.compensation_timeout(),
			),
			checkpoints: CheckpointManager::new(
				config.orchestrator_version.clone(),
				registry,
				config.drift.clone(),
			),
			planner: self.planner,
			store,
			executor,
			config,
		}
	}
}

impl Orchestrator {
	pub fn builder(tools: Arc<dyn ToolExecutor>, planner: Arc<dyn Planner>) -> OrchestratorBuilder {
		OrchestratorBuilder {
			config: EngineConfig::default(),
			tools,
			planner,
			registry: None,
			compensations: None,
			state_store: None,
			execution_store: None,
			breakers: None,
			idempotency: None,
			cost: None,
		}
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	/// Run an already generated plan.
	///
	/// If the request names an execution that already exists, that execution
	/// is resumed instead, so a redelivered request never starts a second run.
	pub async fn execute_plan(
		&self,
		request: ExecutionRequest,
		plan: Plan,
	) -> Result<ExecutionResult, EngineError> {
		if let Some(id) = &request.execution_id
			&& self.load(id).await?.is_some()
		{
			debug!(execution_id = %id, "execution already exists, resuming");
			return self.resume(id).await;
		}

		let started = Instant::now();
		let mut state = request.into_state(plan);
		info!(
			execution_id = %state.execution_id,
			plan_id = %state.plan.id,
			steps = state.plan.len(),
			"starting plan execution"
		);
		state.transition_through(&[
			ExecutionStatus::Parsing,
			ExecutionStatus::Parsed,
			ExecutionStatus::Planning,
			ExecutionStatus::Planned,
		])?;
		self.start(state, started).await
	}

	/// Ask the planner for a plan, then run it.
	pub async fn plan_and_execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, EngineError> {
		if let Some(id) = &request.execution_id
			&& self.load(id).await?.is_some()
		{
			return self.resume(id).await;
		}

		let started = Instant::now();
		let plan_request = request.plan_request();
		let mut state = request.into_state(Plan::new("pending", Vec::new()));
		state.transition_through(&[
			ExecutionStatus::Parsing,
			ExecutionStatus::Parsed,
			ExecutionStatus::Planning,
		])?;
		self.persist(&state).await?;

		let timeout = self.config.repair.planner_timeout();
		let generated = tokio::time::timeout(timeout, self.planner.generate_plan(&plan_request))
			.await
			.unwrap_or(Err(PlannerError::Timeout(timeout)));
		let response = match generated {
			Ok(response) => response,
			Err(e) => {
				warn!(execution_id = %state.execution_id, error = %e, "plan generation failed");
				let code = match e {
					PlannerError::Timeout(_) => ErrorCode::Timeout,
					_ => ErrorCode::UnknownError,
				};
				state.fail(ExecutionFailure {
					code,
					message: format!("plan generation failed: {e}"),
					step_id: None,
				})?;
				self.persist(&state).await?;
				return Ok(ExecutionResult::from_state(&state));
			},
		};

		state.plan = response.plan;
		if let Some(usage) = response.usage {
			state.token_usage.add(usage);
		}
		info!(
			execution_id = %state.execution_id,
			plan_id = %state.plan.id,
			steps = state.plan.len(),
			"plan generated"
		);
		state.transition(ExecutionStatus::Planned)?;
		self.start(state, started).await
	}

	/// Validate a PLANNED execution and enter the main loop.
	async fn start(&self, mut state: ExecutionState, started: Instant) -> Result<ExecutionResult, EngineError> {
		if let Err(e) = state.plan.validate() {
			warn!(execution_id = %state.execution_id, error = %e, "plan rejected");
			state.transition(ExecutionStatus::Rejected)?;
			state.error = Some(ExecutionFailure {
				code: ErrorCode::ValidationFailed,
				message: e.to_string(),
				step_id: None,
			});
			self.persist(&state).await?;
			return Ok(ExecutionResult::from_state(&state));
		}
		state.transition(ExecutionStatus::Executing)?;
		self.persist(&state).await?;
		self.drive(state, started).await
	}

	/// Continue a stored execution.
	///
	/// Terminal executions return their final result. Suspended executions
	/// are checked for drift first; a blocking drift moves them to
	/// REFLECTING until [`Orchestrator::approve_resume`] is called.
	pub async fn resume(&self, execution_id: &str) -> Result<ExecutionResult, EngineError> {
		let started = Instant::now();
		let mut state = self.require(execution_id).await?;

		match state.status {
			status if status.is_terminal() => {
				debug!(execution_id, status = %status, "execution already finished");
				Ok(ExecutionResult::from_state(&state))
			},
			ExecutionStatus::Suspended => {
				let report = self.checkpoints.detect_drift(&state);
				let blocked = report
					.as_ref()
					.is_some_and(|r| r.recommendation == ResumeRecommendation::BlockResume);
				state.drift = report;
				if blocked {
					warn!(execution_id, "resume blocked by drift, awaiting review");
					state.transition(ExecutionStatus::Reflecting)?;
					self.persist(&state).await?;
					return Ok(ExecutionResult::from_state(&state));
				}
				Self::release_checkpoint(&mut state)?;
				state.transition(ExecutionStatus::Executing)?;
				info!(execution_id, "resuming from checkpoint");
				self.drive(state, started).await
			},
			ExecutionStatus::Planned => self.start(state, started).await,
			ExecutionStatus::Executing => self.drive(state, started).await,
			// Waiting on a human: confirm, reject or approve_resume
			_ => Ok(ExecutionResult::from_state(&state)),
		}
	}

	/// Continue an execution whose resume was blocked by drift, after review.
	pub async fn approve_resume(&self, execution_id: &str) -> Result<ExecutionResult, EngineError> {
		let started = Instant::now();
		let mut state = self.require(execution_id).await?;
		if state.status != ExecutionStatus::Reflecting {
			return Err(EngineError::invalid_transition(state.status, ExecutionStatus::Executing));
		}
		Self::release_checkpoint(&mut state)?;
		state.transition(ExecutionStatus::Executing)?;
		info!(execution_id, "resume approved after review");
		self.drive(state, started).await
	}

	/// Confirm steps that are awaiting confirmation and continue.
	pub async fn confirm(&self, execution_id: &str, step_ids: &[&str]) -> Result<ExecutionResult, EngineError> {
		let started = Instant::now();
		let mut state = self.require(execution_id).await?;
		if state.status != ExecutionStatus::AwaitingConfirmation {
			return Err(EngineError::invalid_transition(state.status, ExecutionStatus::Executing));
		}
		for id in step_ids {
			if state.step_status(id) != StepStatus::AwaitingConfirmation {
				return Err(EngineError::new(
					ErrorCode::ValidationFailed,
					format!("step '{id}' is not awaiting confirmation"),
				));
			}
		}
		for id in step_ids {
			state.confirmed_steps.insert(id.to_string());
			if let Some(record) = state.step_state_mut(id) {
				record.transition(StepStatus::Pending)?;
				record.error = None;
			}
		}
		state.transition(ExecutionStatus::Executing)?;
		info!(execution_id, steps = ?step_ids, "steps confirmed");
		self.drive(state, started).await
	}

	/// Decline the pending confirmations; the execution ends REJECTED.
	pub async fn reject(&self, execution_id: &str) -> Result<ExecutionResult, EngineError> {
		let mut state = self.require(execution_id).await?;
		state.transition(ExecutionStatus::Rejected)?;
		let awaiting: Vec<String> = state
			.steps_with_status(StepStatus::AwaitingConfirmation)
			.into_iter()
			.map(|r| r.step_id.clone())
			.collect();
		for id in &awaiting {
			if let Some(record) = state.step_state_mut(id) {
				record.transition(StepStatus::Skipped)?;
			}
		}
		info!(execution_id, skipped = ?awaiting, "execution rejected");
		self.persist(&state).await?;
		Ok(ExecutionResult::from_state(&state))
	}

	pub async fn cancel(&self, execution_id: &str) -> Result<ExecutionResult, EngineError> {
		let mut state = self.require(execution_id).await?;
		state.transition(ExecutionStatus::Cancelled)?;
		info!(execution_id, "execution cancelled");
		self.persist(&state).await?;
		Ok(ExecutionResult::from_state(&state))
	}

	pub async fn get_result(&self, execution_id: &str) -> Result<ExecutionResult, EngineError> {
		let state = self.require(execution_id).await?;
		Ok(ExecutionResult::from_state(&state))
	}

	/// Run the main loop; engine errors mark the execution FAILED.
	async fn drive(&self, mut state: ExecutionState, started: Instant) -> Result<ExecutionResult, EngineError> {
		match self.run_batches(&mut state, started).await {
			Ok(()) => Ok(ExecutionResult::from_state(&state)),
			Err(err) => {
				error!(
					execution_id = %state.execution_id,
					code = %err.code,
					error = %err.message,
					"execution aborted"
				);
				if !state.status.is_terminal() && state.fail(ExecutionFailure::from(&err)).is_ok() {
					self.compensate(&mut state).await;
				}
				if let Err(e) = self.persist(&state).await {
					error!(execution_id = %state.execution_id, error = %e, "failed to persist aborted execution");
				}
				Err(err)
			},
		}
	}

	async fn run_batches(&self, state: &mut ExecutionState, started: Instant) -> Result<(), EngineError> {
		// The first batch of an invocation always runs so every invocation
		// makes progress
		let mut ran_batch = false;
		loop {
			if let Some(max) = state.plan.constraints.max_execution_time_ms {
				let elapsed = (Utc::now() - state.created_at).num_milliseconds().max(0) as u64;
				if elapsed > max {
					warn!(execution_id = %state.execution_id, elapsed_ms = elapsed, max_ms = max, "execution timed out");
					state.transition(ExecutionStatus::Timeout)?;
					state.error = Some(ExecutionFailure {
						code: ErrorCode::Timeout,
						message: format!("execution exceeded {max}ms"),
						step_id: None,
					});
					self.compensate(state).await;
					return self.persist(state).await;
				}
			}

			if let Some(max) = state.plan.constraints.max_tokens
				&& state.token_usage.total_tokens > max
			{
				let used = state.token_usage.total_tokens;
				return self
					.give_up(
						state,
						ExecutionFailure {
							code: ErrorCode::BudgetExceeded,
							message: format!("token usage {used} exceeds the limit of {max}"),
							step_id: None,
						},
					)
					.await;
			}

			let ready: Vec<(usize, PlanStep)> = resolver::ready(&state.plan, state)
				.into_iter()
				.map(|(idx, step)| (idx, step.clone()))
				.collect();

			if ready.is_empty() {
				if !state.steps_with_status(StepStatus::AwaitingConfirmation).is_empty() {
					state.transition(ExecutionStatus::AwaitingConfirmation)?;
					return self.persist(state).await;
				}
				resolver::ensure_progress(state)?;
				state.transition(ExecutionStatus::Completed)?;
				info!(
					execution_id = %state.execution_id,
					completed = state.completed_count(),
					total = state.plan.len(),
					"execution completed"
				);
				return self.persist(state).await;
			}

			if started.elapsed() >= self.config.checkpoint_after() {
				return self.checkpoint(state, &ready).await;
			}
			if ran_batch && self.could_overrun(started, &ready) {
				return self.checkpoint(state, &ready).await;
			}

			self.run_batch(state, &ready).await?;
			ran_batch = true;

			let mut failed = Vec::new();
			let mut awaiting = false;
			for (_, step) in &ready {
				match state.step_status(&step.id) {
					status if status.is_failure() => failed.push(step.id.clone()),
					StepStatus::AwaitingConfirmation => awaiting = true,
					_ => {},
				}
			}

			if !failed.is_empty() {
				state.transition(ExecutionStatus::Reflecting)?;
				match self.repair.repair(state, &failed).await {
					RepairOutcome::GaveUp(failure) => return self.give_up(state, failure).await,
					outcome => {
						debug!(execution_id = %state.execution_id, outcome = ?outcome, "repair succeeded");
						state.transition(ExecutionStatus::Executing)?;
						self.persist(state).await?;
						continue;
					},
				}
			}

			if awaiting {
				info!(execution_id = %state.execution_id, "awaiting confirmation");
				state.transition(ExecutionStatus::AwaitingConfirmation)?;
				return self.persist(state).await;
			}
		}
	}

	/// Run one batch concurrently and fold the results into `state`.
	async fn run_batch(&self, state: &mut ExecutionState, ready: &[(usize, PlanStep)]) -> Result<(), EngineError> {
		for (_, step) in ready {
			state.ensure_step_state(&step.id).transition(StepStatus::InProgress)?;
		}
		debug!(
			execution_id = %state.execution_id,
			steps = ?ready.iter().map(|(_, s)| s.id.as_str()).collect::<Vec<_>>(),
			"running batch"
		);

		let snapshot = state.clone();
		let results = join_all(
			ready
				.iter()
				.map(|(idx, step)| self.executor.run(step, *idx, &snapshot)),
		)
		.await;

		for result in results {
			state.apply_step_result(result)?;
		}
		self.persist(state).await
	}

	/// Whether the slowest step of `ready`, run to its timeout, would end
	/// past the invocation budget.
	fn could_overrun(&self, started: Instant, ready: &[(usize, PlanStep)]) -> bool {
		let longest = ready
			.iter()
			.map(|(_, step)| self.executor.timeout_for(step))
			.max()
			.unwrap_or_default();
		let projected = started.elapsed() + longest;
		if projected > self.config.execution_budget() {
			debug!(
				longest_timeout_ms = longest.as_millis() as u64,
				projected_ms = projected.as_millis() as u64,
				"next batch could outlast the invocation budget"
			);
			return true;
		}
		false
	}

	async fn checkpoint(&self, state: &mut ExecutionState, ready: &[(usize, PlanStep)]) -> Result<(), EngineError> {
		for (_, step) in ready {
			state.ensure_step_state(&step.id).transition(StepStatus::Suspended)?;
		}
		state.checkpoint = Some(self.checkpoints.capture(state));
		state.transition(ExecutionStatus::Suspended)?;
		info!(
			execution_id = %state.execution_id,
			completed = state.completed_count(),
			"invocation budget reached, checkpointing"
		);
		self.persist(state).await
	}

	fn release_checkpoint(state: &mut ExecutionState) -> Result<(), EngineError> {
		let suspended: Vec<String> = state
			.steps_with_status(StepStatus::Suspended)
			.into_iter()
			.map(|r| r.step_id.clone())
			.collect();
		for id in suspended {
			if let Some(record) = state.step_state_mut(&id) {
				record.transition(StepStatus::Pending)?;
			}
		}
		state.checkpoint = None;
		Ok(())
	}

	async fn give_up(&self, state: &mut ExecutionState, failure: ExecutionFailure) -> Result<(), EngineError> {
		warn!(
			execution_id = %state.execution_id,
			code = %failure.code,
			error = %failure.message,
			"execution failed"
		);
		state.fail(failure)?;
		self.compensate(state).await;
		self.persist(state).await
	}

	async fn compensate(&self, state: &mut ExecutionState) {
		let report = self.compensation.compensate(state).await;
		if !report.entries.is_empty() {
			state.compensation = Some(report);
		}
	}

	async fn persist(&self, state: &ExecutionState) -> Result<(), EngineError> {
		self
			.store
			.save_execution_state(state)
			.await
			.map_err(|e| EngineError::persistence(format!("failed to save execution state: {e}")))
	}

	async fn load(&self, execution_id: &str) -> Result<Option<ExecutionState>, EngineError> {
		self
			.store
			.get_execution_state(execution_id)
			.await
			.map_err(|e| EngineError::persistence(format!("failed to load execution state: {e}")))
	}

	async fn require(&self, execution_id: &str) -> Result<ExecutionState, EngineError> {
		self
			.load(execution_id)
			.await?
			.ok_or_else(|| EngineError::not_found(execution_id))
	}
}
