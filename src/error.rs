use thiserror::Error;

/// Failure to turn an aggregate report into an [`AggregateReport`].
///
/// Either variant means the attachment is not a usable report and should be
/// rejected as a whole.
///
/// [`AggregateReport`]: crate::dmarc::AggregateReport
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
	/// The text is not well-formed enough to be read as XML.
	#[error("Malformed XML: {0}")]
	Xml(String),

	/// The document has neither a `feedback`-style wrapper nor top-level
	/// `report_metadata`/`policy_published` elements.
	#[error("Invalid report structure: no report_metadata or policy_published found")]
	InvalidStructure,
}
