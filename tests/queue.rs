use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use report_intake::queue::store::Result as StoreResult;
use report_intake::queue::{
	now_millis, spawn, AckMessage, AckSender, CycleReport, DeliveryQueue, FileStore, MemoryStore, QueueConfig,
	QueueError, QueueStore, SendError, StoreError,
};

const MINUTE: u64 = 60_000;

fn message(report_id: &str, send_at: u64) -> AckMessage {
	AckMessage {
		message_id: format!("<{report_id}@mail.example.net>"),
		reply_to: "noreply-dmarc@example.net".to_string(),
		report_id: report_id.to_string(),
		subject: format!("Re: Report-ID: <{report_id}>"),
		send_at,
	}
}

/// Records every attempt and fails the ones listed in `failing`.
#[derive(Default)]
struct ScriptedSender {
	failing: Vec<String>,
	fail_all: bool,
	attempts: Mutex<Vec<String>>,
}

impl ScriptedSender {
	fn failing_all() -> Self {
		Self {
			fail_all: true,
			..Default::default()
		}
	}

	fn failing(report_ids: &[&str]) -> Self {
		Self {
			failing: report_ids.iter().map(|id| id.to_string()).collect(),
			..Default::default()
		}
	}

	fn attempts(&self) -> Vec<String> {
		self.attempts.lock().unwrap().clone()
	}
}

#[async_trait]
impl AckSender for ScriptedSender {
	async fn send(&self, message: &AckMessage) -> Result<(), SendError> {
		self.attempts.lock().unwrap().push(message.report_id.clone());

		if self.fail_all || self.failing.contains(&message.report_id) {
			Err(SendError::Rejected("550 mailbox unavailable".to_string()))
		} else {
			Ok(())
		}
	}
}

/// Never answers.
struct StuckSender;

#[async_trait]
impl AckSender for StuckSender {
	async fn send(&self, _message: &AckMessage) -> Result<(), SendError> {
		tokio::time::sleep(Duration::from_secs(3600)).await;
		Ok(())
	}
}

/// Forwards every sent message to a channel.
struct ChannelSender(mpsc::UnboundedSender<AckMessage>);

#[async_trait]
impl AckSender for ChannelSender {
	async fn send(&self, message: &AckMessage) -> Result<(), SendError> {
		self.0
			.send(message.clone())
			.map_err(|e| SendError::Transport(e.to_string()))
	}
}

/// A memory store whose writes can be switched off.
#[derive(Default)]
struct FlakyStore {
	inner: MemoryStore,
	broken: Mutex<bool>,
}

impl FlakyStore {
	fn set_broken(&self, broken: bool) {
		*self.broken.lock().unwrap() = broken;
	}

	fn check(&self) -> StoreResult<()> {
		if *self.broken.lock().unwrap() {
			Err(StoreError::Internal("disk on fire".to_string()))
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl QueueStore for FlakyStore {
	async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
		self.inner.get(key).await
	}

	async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
		self.check()?;
		self.inner.put(key, value).await
	}

	async fn delete(&self, key: &str) -> StoreResult<()> {
		self.check()?;
		self.inner.delete(key).await
	}

	async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
		self.inner.list(prefix).await
	}

	async fn alarm(&self) -> StoreResult<Option<u64>> {
		self.inner.alarm().await
	}

	async fn set_alarm(&self, at: u64) -> StoreResult<()> {
		self.check()?;
		self.inner.set_alarm(at).await
	}

	async fn clear_alarm(&self) -> StoreResult<()> {
		self.check()?;
		self.inner.clear_alarm().await
	}
}

fn queue_with(sender: Arc<dyn AckSender>) -> DeliveryQueue {
	DeliveryQueue::new(Arc::new(MemoryStore::new()), sender, QueueConfig::default())
}

#[tokio::test]
async fn test_due_job_is_sent_and_removed() {
	let sender = Arc::new(ScriptedSender::default());
	let mut queue = queue_with(sender.clone());

	queue.enqueue(message("r1", 1_000)).await.unwrap();
	assert_eq!(queue.alarm().await.unwrap(), Some(1_000));

	let report = queue.on_timer_fire(1_000).await.unwrap();

	assert_eq!(report.sent, vec!["r1".to_string()]);
	assert_eq!(sender.attempts(), vec!["r1".to_string()]);
	assert!(queue.pending().await.unwrap().is_empty());
	assert_eq!(queue.alarm().await.unwrap(), None);
}

#[tokio::test]
async fn test_future_job_is_left_alone() {
	let sender = Arc::new(ScriptedSender::default());
	let mut queue = queue_with(sender.clone());

	queue.enqueue(message("later", 10 * MINUTE)).await.unwrap();
	let report = queue.on_timer_fire(MINUTE).await.unwrap();

	assert_eq!(report, CycleReport::default());
	assert!(sender.attempts().is_empty());
	assert_eq!(queue.pending().await.unwrap().len(), 1);
	assert_eq!(queue.alarm().await.unwrap(), Some(10 * MINUTE));
}

#[tokio::test]
async fn test_alarm_tracks_earliest_job() {
	let mut queue = queue_with(Arc::new(ScriptedSender::default()));

	queue.enqueue(message("b", 2_000)).await.unwrap();
	queue.enqueue(message("a", 1_000)).await.unwrap();
	assert_eq!(queue.alarm().await.unwrap(), Some(1_000));

	queue.enqueue(message("c", 5_000)).await.unwrap();
	assert_eq!(queue.alarm().await.unwrap(), Some(1_000));

	queue.enqueue(message("d", 500)).await.unwrap();
	assert_eq!(queue.alarm().await.unwrap(), Some(500));

	// after a cycle the alarm is rebuilt from what's left
	queue.on_timer_fire(1_000).await.unwrap();
	assert_eq!(queue.alarm().await.unwrap(), Some(2_000));
}

#[tokio::test]
async fn test_failing_job_backs_off_then_drops() {
	let sender = Arc::new(ScriptedSender::failing_all());
	let mut queue = queue_with(sender.clone());

	let start = 1_000;
	queue.enqueue(message("r1", start)).await.unwrap();

	let mut now = start;
	for (attempt, delay) in [5, 10, 20, 40].into_iter().enumerate() {
		let report = queue.on_timer_fire(now).await.unwrap();
		let due = now + delay * MINUTE;

		assert_eq!(report.retried, vec![("r1".to_string(), due)]);
		assert_eq!(queue.alarm().await.unwrap(), Some(due));

		let pending = queue.pending().await.unwrap();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].attempts, attempt as u32 + 1);
		assert_eq!(pending[0].message.send_at, due);

		// waking up early changes nothing
		assert_eq!(queue.on_timer_fire(due - 1).await.unwrap(), CycleReport::default());
		now = due;
	}

	let report = queue.on_timer_fire(now).await.unwrap();
	assert_eq!(report.dropped, vec!["r1".to_string()]);
	assert_eq!(sender.attempts().len(), 5);
	assert!(queue.pending().await.unwrap().is_empty());
	assert_eq!(queue.alarm().await.unwrap(), None);
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_batch() {
	let sender = Arc::new(ScriptedSender::failing(&["b"]));
	let mut queue = queue_with(sender.clone());

	queue.enqueue(message("a", 100)).await.unwrap();
	queue.enqueue(message("b", 100)).await.unwrap();
	queue.enqueue(message("c", 100)).await.unwrap();
	queue.enqueue(message("d", 100 * MINUTE)).await.unwrap();

	let report = queue.on_timer_fire(1_000).await.unwrap();

	assert_eq!(report.sent, vec!["a".to_string(), "c".to_string()]);
	assert_eq!(report.retried, vec![("b".to_string(), 1_000 + 5 * MINUTE)]);
	assert_eq!(sender.attempts(), vec!["a".to_string(), "b".to_string(), "c".to_string()]);

	let remaining: Vec<String> = queue
		.pending()
		.await
		.unwrap()
		.into_iter()
		.map(|job| job.message.report_id)
		.collect();
	assert_eq!(remaining, vec!["b".to_string(), "d".to_string()]);
	assert_eq!(queue.alarm().await.unwrap(), Some(1_000 + 5 * MINUTE));
}

#[tokio::test]
async fn test_same_report_replaces_queued_job() {
	let mut queue = queue_with(Arc::new(ScriptedSender::failing_all()));

	queue.enqueue(message("r1", 100)).await.unwrap();
	queue.on_timer_fire(100).await.unwrap();

	let mut replacement = message("r1", 7_000);
	replacement.subject = "Re: again".to_string();
	queue.enqueue(replacement.clone()).await.unwrap();

	let pending = queue.pending().await.unwrap();
	assert_eq!(pending.len(), 1);
	assert_eq!(pending[0].message, replacement);
	assert_eq!(pending[0].attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout_counts_as_failure() {
	let config = QueueConfig {
		send_timeout_secs: 2,
		..Default::default()
	};
	let mut queue = DeliveryQueue::new(Arc::new(MemoryStore::new()), Arc::new(StuckSender), config);

	queue.enqueue(message("slow", 100)).await.unwrap();
	let report = queue.on_timer_fire(100).await.unwrap();

	assert_eq!(report.retried, vec![("slow".to_string(), 100 + 5 * MINUTE)]);
	assert_eq!(queue.pending().await.unwrap()[0].attempts, 1);
}

#[tokio::test]
async fn test_store_errors_are_returned() {
	let store = Arc::new(FlakyStore::default());
	let mut queue = DeliveryQueue::new(store.clone(), Arc::new(ScriptedSender::default()), QueueConfig::default());

	store.set_broken(true);
	let result = queue.enqueue(message("r1", 100)).await;
	assert!(matches!(result, Err(QueueError::Store(StoreError::Internal(_)))));

	store.set_broken(false);
	queue.enqueue(message("r1", 100)).await.unwrap();

	store.set_broken(true);
	assert!(matches!(queue.on_timer_fire(100).await, Err(QueueError::Store(_))));

	// nothing was lost, the next cycle picks it up
	store.set_broken(false);
	let report = queue.on_timer_fire(200).await.unwrap();
	assert_eq!(report.sent.len(), 1);
}

#[tokio::test]
async fn test_file_store_survives_restart() {
	let dir = tempfile::tempdir().unwrap();

	{
		let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
		let mut queue = DeliveryQueue::new(store, Arc::new(ScriptedSender::default()), QueueConfig::default());
		queue.enqueue(message("kept", 3_000)).await.unwrap();
	}

	let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
	let sender = Arc::new(ScriptedSender::default());
	let mut queue = DeliveryQueue::new(store, sender.clone(), QueueConfig::default());

	assert_eq!(queue.alarm().await.unwrap(), Some(3_000));
	assert_eq!(queue.pending().await.unwrap()[0].message, message("kept", 3_000));

	queue.on_timer_fire(3_000).await.unwrap();
	assert_eq!(sender.attempts(), vec!["kept".to_string()]);
}

#[tokio::test]
async fn test_file_store_accepts_long_report_ids() {
	let dir = tempfile::tempdir().unwrap();
	let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
	let sender = Arc::new(ScriptedSender::default());
	let mut queue = DeliveryQueue::new(store, sender.clone(), QueueConfig::default());

	let report_id = "x".repeat(300);
	queue.enqueue(message(&report_id, 100)).await.unwrap();
	assert_eq!(queue.pending().await.unwrap()[0].message.report_id, report_id);

	let report = queue.on_timer_fire(100).await.unwrap();
	assert_eq!(report.sent, vec![report_id]);
	assert!(queue.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_spawned_queue_delivers() {
	let (sent, mut received) = mpsc::unbounded_channel();
	let queue = queue_with(Arc::new(ChannelSender(sent)));
	let (handle, task) = spawn(queue);

	handle.enqueue(message("now", now_millis())).await.unwrap();
	handle.enqueue(message("later", now_millis() + 60 * MINUTE)).await.unwrap();

	let delivered = tokio::time::timeout(Duration::from_secs(5), received.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(delivered.report_id, "now");

	let pending = handle.pending().await.unwrap();
	assert_eq!(pending.len(), 1);
	assert_eq!(pending[0].message.report_id, "later");

	handle.shutdown().await.unwrap();
	task.await.unwrap();

	assert!(matches!(handle.enqueue(message("x", 0)).await, Err(QueueError::Closed)));
}

#[tokio::test]
async fn test_spawned_queue_picks_up_stored_jobs() {
	let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());

	// queued by a previous run, already overdue
	{
		let mut queue = DeliveryQueue::new(store.clone(), Arc::new(ScriptedSender::failing_all()), QueueConfig::default());
		queue.enqueue(message("overdue", 1)).await.unwrap();
	}

	let (sent, mut received) = mpsc::unbounded_channel();
	let queue = DeliveryQueue::new(store, Arc::new(ChannelSender(sent)), QueueConfig::default());
	let (handle, task) = spawn(queue);

	let delivered = tokio::time::timeout(Duration::from_secs(5), received.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(delivered.report_id, "overdue");

	drop(handle);
	task.await.unwrap();
}
