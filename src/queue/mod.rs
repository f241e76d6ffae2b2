//! Delayed delivery of report acknowledgments.
//!
//! Pending replies live in a [`QueueStore`], one entry per report ID, and the
//! whole queue shares a single alarm. Whenever the queue is touched the alarm
//! is moved to the earliest moment any job becomes due, so one timer is
//! enough no matter how many jobs are waiting. A wake-up that finds nothing
//! due is harmless: the alarm is recomputed and the queue goes back to sleep.
//!
//! [`DeliveryQueue`] holds the scheduling logic and expects to be driven by a
//! single owner; [`spawn`] runs it as a task and hands out a cloneable
//! [`QueueHandle`].

mod actor;
mod job;
mod sender;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use actor::{spawn, QueueHandle};
pub use job::{now_millis, AckMessage, PendingJob};
pub use sender::{AckSender, SendError};
pub use store::{FileStore, MemoryStore, QueueStore, StoreError};

/// Key prefix for job entries in the store.
const JOB_PREFIX: &str = "job:";

#[derive(Debug, Error)]
pub enum QueueError {
	/// The backing store failed. Nothing is retried internally; the store is
	/// expected to be durable on its own.
	#[error("Queue store error: {0}")]
	Store(#[from] StoreError),

	/// The queue task has stopped.
	#[error("Delivery queue is no longer running")]
	Closed,
}

/// Retry and timeout settings for the delivery queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
	/// Attempts before a job is dropped.
	///
	/// Default: 5
	#[serde(default = "defaults::max_attempts")]
	pub max_attempts: u32,

	/// Delay before the first retry, in seconds. Each further retry doubles it:
	/// `base * 2^(attempts - 1)`.
	///
	/// Default: 300 seconds (5 minutes)
	#[serde(default = "defaults::base_retry_delay_secs")]
	pub base_retry_delay_secs: u64,

	/// How long a single send may take before it counts as failed.
	///
	/// Default: 30 seconds
	#[serde(default = "defaults::send_timeout_secs")]
	pub send_timeout_secs: u64,

	/// Directory for the file-backed store. Jobs are kept in memory when unset.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub store_path: Option<PathBuf>,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			max_attempts: defaults::max_attempts(),
			base_retry_delay_secs: defaults::base_retry_delay_secs(),
			send_timeout_secs: defaults::send_timeout_secs(),
			store_path: None,
		}
	}
}

impl QueueConfig {
	/// Delay before retrying a job that has failed `attempts` times.
	#[must_use]
	pub fn retry_delay(&self, attempts: u32) -> Duration {
		let exponent = attempts.saturating_sub(1).min(63);
		Duration::from_secs(self.base_retry_delay_secs.saturating_mul(1u64 << exponent))
	}

	#[must_use]
	pub const fn send_timeout(&self) -> Duration {
		Duration::from_secs(self.send_timeout_secs)
	}

	/// Opens the store this configuration points at.
	pub async fn open_store(&self) -> Result<Arc<dyn QueueStore>, StoreError> {
		match &self.store_path {
			Some(path) => Ok(Arc::new(FileStore::open(path).await?)),
			None => Ok(Arc::new(MemoryStore::new())),
		}
	}
}

mod defaults {
	pub const fn max_attempts() -> u32 {
		5
	}

	pub const fn base_retry_delay_secs() -> u64 {
		300
	}

	pub const fn send_timeout_secs() -> u64 {
		30
	}
}

/// What happened during one timer cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
	/// Report IDs whose acknowledgment went out.
	pub sent: Vec<String>,
	/// Report IDs that failed and were rescheduled, with the new due time.
	pub retried: Vec<(String, u64)>,
	/// Report IDs given up on.
	pub dropped: Vec<String>,
}

pub struct DeliveryQueue {
	store: Arc<dyn QueueStore>,
	sender: Arc<dyn AckSender>,
	config: QueueConfig,
}

fn job_key(report_id: &str) -> String {
	format!("{JOB_PREFIX}{report_id}")
}

fn earliest(current: Option<u64>, candidate: u64) -> Option<u64> {
	Some(current.map_or(candidate, |current| current.min(candidate)))
}

impl DeliveryQueue {
	pub fn new(store: Arc<dyn QueueStore>, sender: Arc<dyn AckSender>, config: QueueConfig) -> Self {
		Self { store, sender, config }
	}

	#[must_use]
	pub const fn config(&self) -> &QueueConfig {
		&self.config
	}

	async fn save(&self, job: &PendingJob) -> Result<(), QueueError> {
		let encoded = serde_json::to_vec(job).map_err(StoreError::from)?;
		self.store.put(&job_key(&job.message.report_id), encoded).await?;
		Ok(())
	}

	/// Queues an acknowledgment, replacing any job already queued for the same
	/// report, and pulls the alarm forward if this one is due sooner.
	pub async fn enqueue(&mut self, message: AckMessage) -> Result<(), QueueError> {
		let send_at = message.send_at;
		let report_id = message.report_id.clone();

		self.save(&PendingJob::new(message)).await?;

		match self.store.alarm().await? {
			Some(alarm) if alarm <= send_at => {}
			_ => self.store.set_alarm(send_at).await?,
		}

		debug!(report_id = %report_id, send_at, "Queued acknowledgment");
		Ok(())
	}

	/// Every job currently queued, ordered by report ID.
	///
	/// Entries that can't be decoded are logged and left out.
	pub async fn pending(&self) -> Result<Vec<PendingJob>, QueueError> {
		let entries = self.store.list(JOB_PREFIX).await?;
		let mut jobs = Vec::with_capacity(entries.len());

		for (key, value) in entries {
			match serde_json::from_slice(&value) {
				Ok(job) => jobs.push(job),
				Err(e) => error!(key = %key, error = %e, "Skipping unreadable queue entry"),
			}
		}

		Ok(jobs)
	}

	pub async fn alarm(&self) -> Result<Option<u64>, QueueError> {
		Ok(self.store.alarm().await?)
	}

	async fn attempt(&self, message: &AckMessage) -> Result<(), SendError> {
		let timeout = self.config.send_timeout();
		match tokio::time::timeout(timeout, self.sender.send(message)).await {
			Ok(result) => result,
			Err(_) => Err(SendError::Timeout(timeout)),
		}
	}

	/// Runs one timer cycle at time `now` (milliseconds since the epoch).
	///
	/// Every due job is attempted, even when earlier ones fail. Successful jobs
	/// are removed; failed ones are rescheduled with exponential backoff or,
	/// once `max_attempts` is reached, dropped. Afterwards the alarm is set to
	/// the earliest remaining due time, or cleared if the queue is empty.
	pub async fn on_timer_fire(&mut self, now: u64) -> Result<CycleReport, QueueError> {
		let mut report = CycleReport::default();
		let mut next_alarm = None;

		for mut job in self.pending().await? {
			if !job.is_due(now) {
				next_alarm = earliest(next_alarm, job.message.send_at);
				continue;
			}

			let report_id = job.message.report_id.clone();
			let key = job_key(&report_id);

			match self.attempt(&job.message).await {
				Ok(()) => {
					self.store.delete(&key).await?;
					info!(report_id = %report_id, reply_to = %job.message.reply_to, "Sent acknowledgment");
					report.sent.push(report_id);
				}
				Err(e) => {
					job.attempts += 1;

					if job.attempts >= self.config.max_attempts {
						self.store.delete(&key).await?;
						error!(
							report_id = %report_id,
							attempts = job.attempts,
							error = %e,
							"Giving up on acknowledgment"
						);
						report.dropped.push(report_id);
						continue;
					}

					let delay = self.config.retry_delay(job.attempts);
					let delay_millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
					job.message.send_at = now.saturating_add(delay_millis);
					self.save(&job).await?;

					warn!(
						report_id = %report_id,
						attempts = job.attempts,
						retry_in = ?delay,
						error = %e,
						"Acknowledgment failed, will retry"
					);
					next_alarm = earliest(next_alarm, job.message.send_at);
					report.retried.push((report_id, job.message.send_at));
				}
			}
		}

		match next_alarm {
			Some(at) => self.store.set_alarm(at).await?,
			None => self.store.clear_alarm().await?,
		}

		Ok(report)
	}
}
