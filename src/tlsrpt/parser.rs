use serde_json::Value;
use tracing::debug;

use super::types::{DateRange, DeliveryFailureReport, Policy};

/// Parses an SMTP TLS report.
///
/// Returns `None` for anything that isn't a JSON object carrying a string
/// `organization-name`, a string `report-id` and an object `date-range`. This
/// never fails loudly: a bad TLS report is one attachment among many and is
/// simply skipped.
pub fn parse(json: &str) -> Option<DeliveryFailureReport> {
	let document: Value = match serde_json::from_str(json) {
		Ok(document) => document,
		Err(e) => {
			debug!(error = %e, "TLS report is not valid JSON");
			return None;
		}
	};

	let document = match document {
		Value::Object(document) => document,
		other => {
			debug!(kind = json_kind(&other), "TLS report is not a JSON object");
			return None;
		}
	};

	let organization_name = document.get("organization-name").and_then(Value::as_str);
	let report_id = document.get("report-id").and_then(Value::as_str);
	let date_range = document.get("date-range").filter(|range| range.is_object());

	let (organization_name, report_id, date_range) = match (organization_name, report_id, date_range) {
		(Some(organization_name), Some(report_id), Some(date_range)) => (organization_name, report_id, date_range),
		_ => {
			debug!("TLS report is missing organization-name, report-id or date-range");
			return None;
		}
	};

	let policies = match document.get("policies") {
		None | Some(Value::Null) => None,
		Some(Value::Array(policies)) => Some(policies.iter().map(Policy::from_json).collect()),
		Some(single) => Some(vec![Policy::from_json(single)]),
	};

	Some(DeliveryFailureReport {
		organization_name: organization_name.to_string(),
		report_id: report_id.to_string(),
		date_range: DateRange::from_json(date_range),
		contact_info: document
			.get("contact-info")
			.and_then(Value::as_str)
			.map(str::to_string),
		policies,
	})
}

fn json_kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
