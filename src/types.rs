/// How a report attachment is packaged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportFileType {
	Gzip,
	Zip,
	Xml,
	Json,
}

/// Which kind of report an attachment holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportKind {
	/// DMARC aggregate report (XML).
	Aggregate,
	/// SMTP TLS report (JSON).
	DeliveryFailure,
}
