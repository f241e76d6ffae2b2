//! Turning a received report attachment into stored records and an
//! acknowledgment.
//!
//! Fetching mail and persisting records are someone else's job; this module
//! only needs the attachment, a few envelope fields, and somewhere to put the
//! result.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dmarc::{self, AggregateReport};
use crate::error::ParseError;
use crate::message::{decode_transfer, dmarc_verdict, file_type_for_mime, file_type_for_name, read_report, report_id_from_subject, report_kind};
use crate::queue::{now_millis, AckMessage, QueueError, QueueHandle};
use crate::tlsrpt::{self, DeliveryFailureReport};
use crate::types::ReportKind;

#[derive(Debug, Error)]
pub enum IngestError {
	#[error("Could not unpack attachment: {0}")]
	Attachment(String),

	#[error("Unsupported attachment: {0}")]
	UnsupportedAttachment(String),

	#[error("Invalid aggregate report: {0}")]
	Parse(#[from] ParseError),

	#[error("Could not queue acknowledgment: {0}")]
	Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
	/// How long after receipt an aggregate report is acknowledged, in seconds.
	///
	/// Default: 300 seconds (5 minutes)
	#[serde(default = "defaults::ack_delay_secs")]
	pub ack_delay_secs: u64,

	/// Prepended to the report's subject to form the reply subject.
	///
	/// Default: "Re: "
	#[serde(default = "defaults::ack_subject_prefix")]
	pub ack_subject_prefix: String,

	/// Refuse report emails whose `Authentication-Results` say `dmarc=fail`.
	///
	/// Default: true
	#[serde(default = "defaults::reject_dmarc_fail")]
	pub reject_dmarc_fail: bool,
}

impl Default for IngestConfig {
	fn default() -> Self {
		Self {
			ack_delay_secs: defaults::ack_delay_secs(),
			ack_subject_prefix: defaults::ack_subject_prefix(),
			reject_dmarc_fail: defaults::reject_dmarc_fail(),
		}
	}
}

mod defaults {
	pub const fn ack_delay_secs() -> u64 {
		300
	}

	pub fn ack_subject_prefix() -> String {
		"Re: ".to_string()
	}

	pub const fn reject_dmarc_fail() -> bool {
		true
	}
}

/// A report attachment as it came out of the email.
#[derive(Debug, Clone, Default)]
pub struct Attachment {
	pub file_name: Option<String>,
	pub content_type: Option<String>,
	/// Still base64 transfer-encoded.
	pub base64: bool,
	pub data: Vec<u8>,
}

/// The parts of the report email needed to accept and answer it.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
	pub message_id: String,
	/// Where the acknowledgment goes. No acknowledgment is queued without one.
	pub reply_to: Option<String>,
	pub subject: String,
	pub authentication_results: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
	Aggregate(AggregateReport),
	DeliveryFailure(DeliveryFailureReport),
	/// The attachment was read but held no usable TLS report.
	Skipped,
}

/// Where normalized reports end up.
///
/// A sink deals with its own failures; the ingestion path never hears about
/// them.
#[async_trait]
pub trait ReportSink: Send + Sync {
	async fn store_aggregate(&self, report: &AggregateReport);

	async fn store_delivery_failure(&self, report: &DeliveryFailureReport);
}

/// Logs a one-line summary of every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl ReportSink for TracingSink {
	async fn store_aggregate(&self, report: &AggregateReport) {
		info!(
			report_id = %report.report_id,
			org = %report.org_name,
			domain = %report.domain,
			dkim_pass = report.dkim_pass,
			dkim_fail = report.dkim_fail,
			spf_pass = report.spf_pass,
			spf_fail = report.spf_fail,
			"Aggregate report"
		);
	}

	async fn store_delivery_failure(&self, report: &DeliveryFailureReport) {
		info!(
			report_id = %report.report_id,
			org = %report.organization_name,
			policies = report.policies.as_ref().map_or(0, Vec::len),
			"TLS report"
		);
	}
}

/// Writes each report as one line of JSON.
pub struct JsonLinesSink {
	writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
	pub fn new(writer: impl Write + Send + 'static) -> Self {
		Self {
			writer: Mutex::new(Box::new(writer)),
		}
	}

	fn write_line(&self, value: &impl Serialize) {
		let line = match serde_json::to_string(value) {
			Ok(line) => line,
			Err(e) => {
				error!(error = %e, "Could not serialize report");
				return;
			}
		};

		let mut writer = match self.writer.lock() {
			Ok(writer) => writer,
			Err(poisoned) => poisoned.into_inner(),
		};
		if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
			error!(error = %e, "Could not write report");
		}
	}
}

#[async_trait]
impl ReportSink for JsonLinesSink {
	async fn store_aggregate(&self, report: &AggregateReport) {
		self.write_line(report);
	}

	async fn store_delivery_failure(&self, report: &DeliveryFailureReport) {
		self.write_line(report);
	}
}

/// Hands every report to several sinks in turn.
#[derive(Clone, Default)]
pub struct MultiSink {
	sinks: Vec<Arc<dyn ReportSink>>,
}

impl MultiSink {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with(mut self, sink: Arc<dyn ReportSink>) -> Self {
		self.sinks.push(sink);
		self
	}
}

#[async_trait]
impl ReportSink for MultiSink {
	async fn store_aggregate(&self, report: &AggregateReport) {
		for sink in &self.sinks {
			sink.store_aggregate(report).await;
		}
	}

	async fn store_delivery_failure(&self, report: &DeliveryFailureReport) {
		for sink in &self.sinks {
			sink.store_delivery_failure(report).await;
		}
	}
}

pub struct Ingestor {
	config: IngestConfig,
	sink: Arc<dyn ReportSink>,
	queue: Option<QueueHandle>,
}

impl Ingestor {
	pub fn new(config: IngestConfig, sink: Arc<dyn ReportSink>) -> Self {
		Self {
			config,
			sink,
			queue: None,
		}
	}

	/// Acknowledge aggregate reports through `queue`.
	#[must_use]
	pub fn with_queue(mut self, queue: QueueHandle) -> Self {
		self.queue = Some(queue);
		self
	}

	/// Whether a report email should be processed at all.
	///
	/// Only an explicit `dmarc=fail` is refused; a missing header or any other
	/// verdict is let through.
	pub fn accepts(&self, envelope: &Envelope) -> bool {
		if !self.config.reject_dmarc_fail {
			return true;
		}

		let verdict = envelope
			.authentication_results
			.as_deref()
			.and_then(dmarc_verdict);
		if verdict.as_deref() == Some("fail") {
			warn!(
				message_id = %envelope.message_id,
				report_id = ?report_id_from_subject(&envelope.subject),
				"Refusing report email that failed DMARC"
			);
			return false;
		}

		true
	}

	fn unpack(attachment: Attachment) -> Result<(ReportKind, String), IngestError> {
		let content_type = attachment.content_type.as_deref();
		let file_name = attachment.file_name.as_deref();

		let file_type = content_type
			.and_then(file_type_for_mime)
			.or_else(|| file_name.and_then(file_type_for_name))
			.ok_or_else(|| {
				IngestError::UnsupportedAttachment(format!(
					"type {} / name {}",
					content_type.unwrap_or("-"),
					file_name.unwrap_or("-")
				))
			})?;
		let mut kind = report_kind(content_type, file_name);

		let data = if attachment.base64 {
			decode_transfer(&attachment.data).map_err(|e| IngestError::Attachment(e.to_string()))?
		} else {
			attachment.data
		};
		let text = read_report(file_type, data).map_err(|e| IngestError::Attachment(e.to_string()))?;

		// compressed TLS reports are often sent as plain application/gzip
		if kind == ReportKind::Aggregate && text.trim_start().starts_with('{') {
			kind = ReportKind::DeliveryFailure;
		}

		Ok((kind, text))
	}

	/// Unpacks, parses and stores one attachment, and queues an acknowledgment
	/// for aggregate reports when the envelope has a reply address.
	pub async fn ingest(&self, attachment: Attachment, envelope: Option<&Envelope>) -> Result<Ingested, IngestError> {
		let (kind, text) = Self::unpack(attachment)?;

		match kind {
			ReportKind::Aggregate => {
				let report = dmarc::parse(&text)?;
				self.sink.store_aggregate(&report).await;

				if let Some(envelope) = envelope {
					self.acknowledge(&report, envelope).await?;
				}
				Ok(Ingested::Aggregate(report))
			}
			ReportKind::DeliveryFailure => match tlsrpt::parse(&text) {
				Some(report) => {
					self.sink.store_delivery_failure(&report).await;
					Ok(Ingested::DeliveryFailure(report))
				}
				None => {
					warn!(
						message_id = ?envelope.map(|envelope| envelope.message_id.as_str()),
						"Skipping attachment without a usable TLS report"
					);
					Ok(Ingested::Skipped)
				}
			},
		}
	}

	async fn acknowledge(&self, report: &AggregateReport, envelope: &Envelope) -> Result<(), IngestError> {
		let (queue, reply_to) = match (&self.queue, &envelope.reply_to) {
			(Some(queue), Some(reply_to)) => (queue, reply_to),
			_ => return Ok(()),
		};

		// the report ID keys the queue, so fall back to something that's
		// still unique to this email
		let report_id = if !report.report_id.is_empty() {
			report.report_id.clone()
		} else {
			report_id_from_subject(&envelope.subject).unwrap_or_else(|| envelope.message_id.clone())
		};

		let delay = Duration::from_secs(self.config.ack_delay_secs);
		let delay_millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
		let message = AckMessage {
			message_id: envelope.message_id.clone(),
			reply_to: reply_to.clone(),
			report_id,
			subject: format!("{}{}", self.config.ack_subject_prefix, envelope.subject),
			send_at: now_millis().saturating_add(delay_millis),
		};

		debug!(report_id = %message.report_id, reply_to = %message.reply_to, "Queueing acknowledgment");
		queue.enqueue(message).await?;
		Ok(())
	}
}
