//! Unpacking report attachments and reading the headers around them.

use flate2::read::GzDecoder;
use regex::Regex;
use simple_error::bail;
use std::error::Error;
use std::io::{prelude::*, Cursor};
use std::sync::LazyLock;
use super::types::{ReportFileType, ReportKind};

/// Works out how an attachment is packaged from its MIME type.
pub fn file_type_for_mime(mime: &str) -> Option<ReportFileType> {
	let mime = mime.split(';').next().unwrap_or("").trim().to_lowercase();
	match mime.as_str() {
		"application/gzip" | "application/x-gzip" | "application/tlsrpt+gzip" => Some(ReportFileType::Gzip),
		"application/zip" | "application/x-zip-compressed" => Some(ReportFileType::Zip),
		"text/xml" | "application/xml" => Some(ReportFileType::Xml),
		"application/json" | "application/tlsrpt+json" => Some(ReportFileType::Json),
		_ => None,
	}
}

/// Works out how an attachment is packaged from its file name.
pub fn file_type_for_name(name: &str) -> Option<ReportFileType> {
	let name = name.to_lowercase();
	if name.ends_with(".gz") || name.ends_with(".gzip") {
		Some(ReportFileType::Gzip)
	} else if name.ends_with(".zip") {
		Some(ReportFileType::Zip)
	} else if name.ends_with(".xml") {
		Some(ReportFileType::Xml)
	} else if name.ends_with(".json") {
		Some(ReportFileType::Json)
	} else {
		None
	}
}

/// Decides whether an attachment is a TLS report or a DMARC report.
///
/// TLS reports announce themselves with an `application/tlsrpt+*` type, and
/// are JSON; everything else is taken to be a DMARC aggregate report.
pub fn report_kind(mime: Option<&str>, name: Option<&str>) -> ReportKind {
	let mime = mime.unwrap_or("").to_lowercase();
	let name = name.unwrap_or("").to_lowercase();

	if mime.contains("tlsrpt") || name.contains("tlsrpt") {
		return ReportKind::DeliveryFailure;
	}

	let json_name = name.ends_with(".json") || name.ends_with(".json.gz");
	if mime.starts_with("application/json") || json_name {
		ReportKind::DeliveryFailure
	} else {
		ReportKind::Aggregate
	}
}

/// Decodes a base64 transfer-encoded attachment body, ignoring line breaks.
pub fn decode_transfer(body: &[u8]) -> Result<Vec<u8>, Box<dyn Error>> {
	let compact: Vec<u8> = body
		.iter()
		.copied()
		.filter(|b| !b.is_ascii_whitespace())
		.collect();
	Ok(base64::decode(&compact)?)
}

/// Given a report type and the raw data in bytes, decompresses the report into a String.
pub fn read_report(report_type: ReportFileType, data: Vec<u8>) -> Result<String, Box<dyn Error>> {
	let body_reader = Cursor::new(data);
	match report_type {
		ReportFileType::Gzip => {
			let mut d = GzDecoder::new(body_reader);
			let mut result = String::new();
			d.read_to_string(&mut result)?;
			Ok(result)
		},
		ReportFileType::Zip => {
			let mut archive = zip::ZipArchive::new(body_reader)?;

			if archive.len() != 1 {
				bail!("ZIP archive has multiple or no files");
			}

			let mut report_file = archive.by_index(0)?;
			let mut result = String::new();
			report_file.read_to_string(&mut result)?;
			Ok(result)
		},
		ReportFileType::Xml | ReportFileType::Json => {
			Ok(String::from_utf8(body_reader.into_inner())?)
		}
	}
}

static REPORT_ID_PATTERN: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"Report-ID:\s*<?([^<>\s]+)>?").expect("Invalid regex pattern"));

static DMARC_VERDICT_PATTERN: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"(?i)\bdmarc\s*=\s*([a-z]+)").expect("Invalid regex pattern"));

/// Pulls the report ID out of a report subject line, e.g.
/// `Report Domain: example.com Submitter: google.com Report-ID: <1234>`.
pub fn report_id_from_subject(subject: &str) -> Option<String> {
	let captures = REPORT_ID_PATTERN.captures(subject)?;
	Some(captures.get(1)?.as_str().to_string())
}

/// The `dmarc=` verdict from an `Authentication-Results` header, lower-cased.
pub fn dmarc_verdict(authentication_results: &str) -> Option<String> {
	let captures = DMARC_VERDICT_PATTERN.captures(authentication_results)?;
	Some(captures.get(1)?.as_str().to_lowercase())
}
