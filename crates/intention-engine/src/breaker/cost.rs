//! Spend guard for tool calls that cost money.
//!
//! Tracks a running total per execution and per user per UTC day. A charge
//! that would push either total past its cap is rejected before the tool is
//! called. Crossing the daily cap also blacklists the user for a while.
//!
//! The ledger lives in a [`StateStore`] so caps and blacklists hold across
//! invocations:
//!
//! | key                    | value         | expires                  |
//! |------------------------|---------------|--------------------------|
//! | `cost:exec:{id}`       | dollars spent | `execution_ttl_secs`     |
//! | `cost:{user}:{date}`   | dollars spent | end of that UTC day      |
//! | `blacklist:{user}`     | blocked until | end of the blacklist     |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::stateful::{MemoryStore, StateStore, StateStoreExt, StoreError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BudgetError {
	#[error(
		"execution '{execution_id}' would spend ${projected:.2}, above its ${cap:.2} cap"
	)]
	ExecutionCap {
		execution_id: String,
		projected: f64,
		cap: f64,
	},

	#[error("user '{user_id}' would spend ${projected:.2} today, above the ${cap:.2} daily cap")]
	DailyCap {
		user_id: String,
		projected: f64,
		cap: f64,
	},

	#[error("user '{user_id}' is blocked from spending until {until}")]
	Blacklisted {
		user_id: String,
		until: DateTime<Utc>,
	},

	#[error("cost ledger unavailable: {0}")]
	State(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CostConfig {
	/// Dollar cap for a single execution
	pub max_cost_per_execution: f64,
	/// Dollar cap per user per UTC day
	pub max_daily_cost_per_user: f64,
	pub blacklist_duration_secs: u64,
	/// How long a per-execution total is kept after its last charge
	pub execution_ttl_secs: u64,
}

impl Default for CostConfig {
	fn default() -> Self {
		Self {
			max_cost_per_execution: 10.0,
			max_daily_cost_per_user: 5.0,
			blacklist_duration_secs: 24 * 60 * 60,
			execution_ttl_secs: 7 * 24 * 60 * 60,
		}
	}
}

impl CostConfig {
	pub fn blacklist_duration(&self) -> Duration {
		Duration::from_secs(self.blacklist_duration_secs)
	}

	pub fn execution_ttl(&self) -> Duration {
		Duration::from_secs(self.execution_ttl_secs)
	}
}

fn execution_key(execution_id: &str) -> String {
	format!("cost:exec:{execution_id}")
}

fn daily_key(user_id: &str, date: NaiveDate) -> String {
	format!("cost:{user_id}:{date}")
}

fn blacklist_key(user_id: &str) -> String {
	format!("blacklist:{user_id}")
}

/// Time left until `until`, at least one second so the record is written.
fn ttl_until(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
	(until - now)
		.to_std()
		.unwrap_or_default()
		.max(Duration::from_secs(1))
}

fn end_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
	now
		.date_naive()
		.succ_opt()
		.and_then(|d| d.and_hms_opt(0, 0, 0))
		.map(|t| t.and_utc())
		.unwrap_or(now + chrono::Duration::days(1))
}

pub struct CostCircuitBreaker {
	config: CostConfig,
	store: Arc<dyn StateStore>,
	// Serialises read-modify-write of the ledger within this process
	lock: tokio::sync::Mutex<()>,
}

impl CostCircuitBreaker {
	pub fn new(store: Arc<dyn StateStore>, config: CostConfig) -> Self {
		Self {
			config,
			store,
			lock: tokio::sync::Mutex::new(()),
		}
	}

	/// Ledger kept in a process-local store.
	pub fn in_memory(config: CostConfig) -> Self {
		Self::new(Arc::new(MemoryStore::new()), config)
	}

	async fn amount(&self, key: &str) -> Result<f64, StoreError> {
		Ok(self.store.get_json::<f64>(key).await?.unwrap_or(0.0))
	}

	async fn blocked_until(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
		self.store.get_json(&blacklist_key(user_id)).await
	}

	/// Accept or reject a charge of `cost` dollars. Accepted charges are
	/// recorded immediately.
	///
	/// Executions without a user are only held to the per-execution cap.
	pub async fn charge(
		&self,
		user_id: Option<&str>,
		execution_id: &str,
		cost: f64,
		now: DateTime<Utc>,
	) -> Result<(), BudgetError> {
		let _guard = self.lock.lock().await;

		if let Some(user) = user_id
			&& let Some(until) = self.blocked_until(user).await?
		{
			if until > now {
				return Err(BudgetError::Blacklisted {
					user_id: user.to_string(),
					until,
				});
			}
			self.store.delete(&blacklist_key(user)).await?;
		}

		let exec_key = execution_key(execution_id);
		let projected = self.amount(&exec_key).await? + cost;
		if projected > self.config.max_cost_per_execution {
			warn!(
				execution_id,
				projected, "execution cost cap exceeded, rejecting charge"
			);
			return Err(BudgetError::ExecutionCap {
				execution_id: execution_id.to_string(),
				projected,
				cap: self.config.max_cost_per_execution,
			});
		}

		let mut daily = None;
		if let Some(user) = user_id {
			let key = daily_key(user, now.date_naive());
			let projected_daily = self.amount(&key).await? + cost;
			if projected_daily > self.config.max_daily_cost_per_user {
				let until = now
					+ chrono::Duration::from_std(self.config.blacklist_duration())
						.unwrap_or_else(|_| chrono::Duration::days(1));
				warn!(
					user_id = user,
					projected = projected_daily,
					%until,
					"daily cost cap exceeded, user blacklisted"
				);
				self
					.store
					.set_json(&blacklist_key(user), &until, Some(ttl_until(now, until)))
					.await?;
				return Err(BudgetError::DailyCap {
					user_id: user.to_string(),
					projected: projected_daily,
					cap: self.config.max_daily_cost_per_user,
				});
			}
			daily = Some((key, projected_daily));
		}

		self
			.store
			.set_json(&exec_key, &projected, Some(self.config.execution_ttl()))
			.await?;
		if let Some((key, total)) = daily {
			self
				.store
				.set_json(&key, &total, Some(ttl_until(now, end_of_day(now))))
				.await?;
		}
		debug!(execution_id, cost, "charge accepted");
		Ok(())
	}

	pub async fn execution_spend(&self, execution_id: &str) -> Result<f64, StoreError> {
		self.amount(&execution_key(execution_id)).await
	}

	pub async fn daily_spend(&self, user_id: &str, now: DateTime<Utc>) -> Result<f64, StoreError> {
		self.amount(&daily_key(user_id, now.date_naive())).await
	}

	pub async fn is_blacklisted(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
		Ok(self.blocked_until(user_id).await?.is_some_and(|until| until > now))
	}

	/// Lift a blacklist before it expires.
	pub async fn clear_blacklist(&self, user_id: &str) -> Result<(), StoreError> {
		self.store.delete(&blacklist_key(user_id)).await
	}
}
