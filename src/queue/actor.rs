//! Background task that owns a [`DeliveryQueue`].
//!
//! All enqueues and timer cycles for a queue go through this one task, so they
//! never interleave their reads and writes against the store.

use std::future::pending;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use super::{now_millis, AckMessage, DeliveryQueue, PendingJob, QueueError};

/// How long to wait, in milliseconds, before trying again after a timer cycle
/// hit a store error.
const STORE_RETRY_MILLIS: u64 = 1_000;

const COMMAND_BUFFER: usize = 64;

enum Command {
	Enqueue(AckMessage, oneshot::Sender<Result<(), QueueError>>),
	Pending(oneshot::Sender<Result<Vec<PendingJob>, QueueError>>),
	Shutdown,
}

/// Cloneable handle to a running delivery queue.
#[derive(Clone, Debug)]
pub struct QueueHandle {
	commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Command::Enqueue(message, _) => write!(f, "Enqueue({})", message.report_id),
			Command::Pending(_) => write!(f, "Pending"),
			Command::Shutdown => write!(f, "Shutdown"),
		}
	}
}

impl QueueHandle {
	async fn request<T>(
		&self,
		command: impl FnOnce(oneshot::Sender<Result<T, QueueError>>) -> Command,
	) -> Result<T, QueueError> {
		let (reply, response) = oneshot::channel();
		self.commands
			.send(command(reply))
			.await
			.map_err(|_| QueueError::Closed)?;
		response.await.map_err(|_| QueueError::Closed)?
	}

	/// Queues an acknowledgment. See [`DeliveryQueue::enqueue`].
	pub async fn enqueue(&self, message: AckMessage) -> Result<(), QueueError> {
		self.request(|reply| Command::Enqueue(message, reply)).await
	}

	/// Snapshot of every queued job.
	pub async fn pending(&self) -> Result<Vec<PendingJob>, QueueError> {
		self.request(Command::Pending).await
	}

	/// Asks the queue task to stop. Jobs stay in the store.
	pub async fn shutdown(&self) -> Result<(), QueueError> {
		self.commands
			.send(Command::Shutdown)
			.await
			.map_err(|_| QueueError::Closed)
	}
}

/// Starts the task driving `queue`.
///
/// The task starts with a timer cycle over whatever is already in the store,
/// so jobs queued before a restart are still delivered. It runs until
/// [`QueueHandle::shutdown`] is called or every handle is dropped.
pub fn spawn(queue: DeliveryQueue) -> (QueueHandle, JoinHandle<()>) {
	let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
	let handle = tokio::spawn(run(queue, receiver));

	(QueueHandle { commands }, handle)
}

/// Converts an epoch-millisecond alarm to a point on tokio's clock.
fn deadline(at: u64) -> Instant {
	Instant::now() + Duration::from_millis(at.saturating_sub(now_millis()))
}

async fn wait_for(alarm: Option<u64>) {
	match alarm {
		Some(at) => sleep_until(deadline(at)).await,
		None => pending().await,
	}
}

fn sooner(a: Option<u64>, b: Option<u64>) -> Option<u64> {
	match (a, b) {
		(Some(a), Some(b)) => Some(a.min(b)),
		(a, b) => a.or(b),
	}
}

async fn refresh_alarm(queue: &DeliveryQueue, previous: Option<u64>) -> Option<u64> {
	match queue.alarm().await {
		Ok(alarm) => alarm,
		Err(e) => {
			error!(error = %e, "Could not read queue alarm");
			previous
		}
	}
}

async fn run(mut queue: DeliveryQueue, mut commands: mpsc::Receiver<Command>) {
	// First cycle runs straight away: it delivers anything that fell due while
	// nothing was running and rebuilds the alarm from the stored jobs.
	let mut alarm = Some(now_millis());
	debug!("Delivery queue started");

	loop {
		tokio::select! {
			command = commands.recv() => {
				match command {
					Some(Command::Enqueue(message, reply)) => {
						let result = queue.enqueue(message).await;
						// keep a pending startup cycle if it is sooner
						alarm = sooner(alarm, refresh_alarm(&queue, alarm).await);
						let _ = reply.send(result);
					}
					Some(Command::Pending(reply)) => {
						let _ = reply.send(queue.pending().await);
					}
					Some(Command::Shutdown) | None => break,
				}
			}

			() = wait_for(alarm) => {
				match queue.on_timer_fire(now_millis()).await {
					Ok(report) => {
						debug!(
							sent = report.sent.len(),
							retried = report.retried.len(),
							dropped = report.dropped.len(),
							"Delivery cycle finished"
						);
						alarm = refresh_alarm(&queue, None).await;
					}
					Err(e) => {
						error!(error = %e, "Delivery cycle failed");
						alarm = Some(now_millis().saturating_add(STORE_RETRY_MILLIS));
					}
				}
			}
		}
	}

	info!("Delivery queue stopped");
}
