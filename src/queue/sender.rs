use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::AckMessage;

/// Why an acknowledgment could not be sent. Every variant is retried the same
/// way; the distinction only shows up in logs.
#[derive(Debug, Error)]
pub enum SendError {
	/// The receiving side refused the message.
	#[error("Rejected: {0}")]
	Rejected(String),

	/// No answer within the configured send timeout.
	#[error("Timed out after {0:?}")]
	Timeout(Duration),

	/// Anything else between us and the receiving side.
	#[error("Transport error: {0}")]
	Transport(String),
}

/// Something that can deliver an acknowledgment reply.
///
/// Composing and transmitting the actual email lives outside this crate;
/// the queue only needs to know whether it worked.
#[async_trait]
pub trait AckSender: Send + Sync {
	async fn send(&self, message: &AckMessage) -> Result<(), SendError>;
}
