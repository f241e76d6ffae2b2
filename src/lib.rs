//! Intake for email-delivered domain reports.
//!
//! DMARC aggregate reports (XML) and SMTP TLS reports (JSON) are normalized
//! into flat records, and aggregate reports are acknowledged through a
//! persistent delayed-delivery queue.

pub mod config;
pub mod dmarc;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod message;
pub mod queue;
pub mod tlsrpt;
pub mod types;

pub use config::Config;
pub use error::ParseError;
pub use ingest::{Attachment, Envelope, Ingested, Ingestor, IngestError};
