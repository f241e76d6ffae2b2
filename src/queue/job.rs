use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// An acknowledgment reply waiting to be sent for a report.
///
/// The queue never looks inside this beyond `report_id` and `send_at`; it is
/// handed to the [`AckSender`](super::AckSender) as is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
	/// `Message-ID` of the report email being acknowledged.
	pub message_id: String,
	pub reply_to: String,
	pub report_id: String,
	pub subject: String,
	/// When the reply is due, in milliseconds since the Unix epoch.
	pub send_at: u64,
}

/// A queued [`AckMessage`] and the number of failed attempts so far.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
	pub message: AckMessage,
	pub attempts: u32,
}

impl PendingJob {
	pub fn new(message: AckMessage) -> PendingJob {
		PendingJob { message, attempts: 0 }
	}

	pub fn is_due(&self, now: u64) -> bool {
		self.message.send_at <= now
	}
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_millis() as u64)
		.unwrap_or(0)
}
