use serde_json::{Map, Value};
use tracing::debug;

use super::tree::{self, first, text, to_sequence};
use super::types::{AggregateReport, ResultTally, DEFAULT_POLICY};
use crate::error::ParseError;

const METADATA: &str = "report_metadata";
const POLICY: &str = "policy_published";
const WRAPPER: &str = "feedback";

fn has_report_fields(node: &Map<String, Value>) -> bool {
	node.contains_key(METADATA) || node.contains_key(POLICY)
}

/// Finds the node holding `report_metadata`, `policy_published` and the
/// records. That's normally the `<feedback>` root, but any top-level element
/// wrapping those fields is accepted, and failing that the fields themselves
/// may sit at the top level.
fn locate_feedback(document: &Map<String, Value>) -> Option<&Map<String, Value>> {
	let named = to_sequence(document.get(WRAPPER)).into_iter();
	let others = document
		.iter()
		.filter(|(name, _)| name.as_str() != WRAPPER)
		.flat_map(|(_, node)| to_sequence(Some(node)));

	named
		.chain(others)
		.filter_map(Value::as_object)
		.find(|node| has_report_fields(node))
		.or_else(|| Some(document).filter(|document| has_report_fields(document)))
}

/// Parses the leading integer of a timestamp field, the way lenient report
/// consumers do: surrounding whitespace is ignored and anything after the
/// digits (a fraction, a stray suffix) is dropped.
fn parse_epoch(raw: Option<&str>) -> Option<i64> {
	let raw = raw?.trim();
	let (sign, digits) = match raw.strip_prefix('-') {
		Some(rest) => (-1, rest),
		None => (1, raw.strip_prefix('+').unwrap_or(raw)),
	};
	let end = digits
		.find(|c: char| !c.is_ascii_digit())
		.unwrap_or(digits.len());

	digits[..end].parse::<i64>().ok().map(|value| sign * value)
}

fn epoch_field(range: Option<&Value>, field: &str) -> i64 {
	let raw = text(range.and_then(|range| range.get(field)));
	parse_epoch(raw).unwrap_or_else(|| {
		debug!(field, value = ?raw, "Unusable date in report, defaulting to 0");
		0
	})
}

fn tally_results(records: &[&Value], namespace: &str) -> ResultTally {
	let mut tally = ResultTally::default();

	for record in records {
		let auth_results = match record.get("auth_results") {
			Some(auth_results) => auth_results,
			None => continue,
		};

		for auth_results in to_sequence(Some(auth_results)) {
			for entry in to_sequence(auth_results.get(namespace)) {
				tally.record(text(entry.get("result")));
			}
		}
	}

	tally
}

/// Parses a DMARC aggregate report.
///
/// Missing fields never fail the parse; they fall back to empty strings, `0`
/// and a `none` policy. Only a document with no recognizable report in it is
/// rejected.
pub fn parse(xml: &str) -> Result<AggregateReport, ParseError> {
	let document = tree::parse_document(xml)?;
	let feedback = locate_feedback(&document).ok_or(ParseError::InvalidStructure)?;

	let metadata = first(feedback.get(METADATA));
	let policy = first(feedback.get(POLICY));
	let date_range = metadata.and_then(|metadata| first(metadata.get("date_range")));

	let metadata_text = |field: &str| {
		text(metadata.and_then(|metadata| metadata.get(field)))
			.unwrap_or_default()
			.to_string()
	};

	let policy_p = match text(policy.and_then(|policy| policy.get("p"))) {
		Some(p) if !p.is_empty() => p.to_string(),
		_ => DEFAULT_POLICY.to_string(),
	};

	let records = to_sequence(feedback.get("record"));
	let dkim = tally_results(&records, "dkim");
	let spf = tally_results(&records, "spf");

	Ok(AggregateReport {
		report_id: metadata_text("report_id"),
		org_name: metadata_text("org_name"),
		domain: text(policy.and_then(|policy| policy.get("domain")))
			.unwrap_or_default()
			.to_string(),
		begin_date: epoch_field(date_range, "begin"),
		end_date: epoch_field(date_range, "end"),
		dkim_pass: dkim.pass,
		dkim_fail: dkim.fail,
		dkim_temperror: dkim.temperror,
		spf_pass: spf.pass,
		spf_fail: spf.fail,
		spf_temperror: spf.temperror,
		policy_p,
		raw_xml: xml.to_string(),
	})
}
