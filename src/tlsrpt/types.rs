use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An SMTP TLS report (RFC 8460).
///
/// Only the organization, report ID and date range are validated. Policies are
/// kept as sent, with absent or mistyped fields replaced by defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailureReport {
	pub organization_name: String,
	pub report_id: String,
	pub date_range: DateRange,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub contact_info: Option<String>,
	/// `None` when the report carries no `policies` member at all.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub policies: Option<Vec<Policy>>,
}

/// Reporting window, as ISO-8601 timestamps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
	pub start: String,
	pub end: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
	/// `sts`, `tlsa`, `no-policy-found`, or whatever the reporter used.
	pub policy_type: String,
	pub policy_domain: String,
	pub policy_strings: Vec<String>,
	pub mx_hosts: Vec<String>,
	pub summary: Summary,
	/// `None` when the policy has no `failure-details` member; consumers treat
	/// that the same as an empty list.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub failure_details: Option<Vec<FailureDetail>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
	pub success_count: u64,
	pub failure_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
	pub result_type: String,
	pub sending_mta_ip: Option<String>,
	pub receiving_mx_hostname: Option<String>,
	pub receiving_ip: Option<String>,
	pub failed_session_count: u64,
	pub failure_reason_code: Option<String>,
	pub additional_information: Option<String>,
}

static NULL: Value = Value::Null;

fn string(node: &Value, field: &str) -> Option<String> {
	node.get(field).and_then(Value::as_str).map(str::to_string)
}

fn strings(node: &Value, field: &str) -> Vec<String> {
	match node.get(field) {
		Some(Value::Array(items)) => items
			.iter()
			.filter_map(Value::as_str)
			.map(str::to_string)
			.collect(),
		Some(Value::String(single)) => vec![single.clone()],
		_ => Vec::new(),
	}
}

/// Reads a session count. Some reporters send counts as strings; negative or
/// unreadable values count as zero.
fn count(node: &Value, field: &str) -> u64 {
	match node.get(field) {
		Some(Value::Number(n)) => n
			.as_u64()
			.or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
			.unwrap_or(0),
		Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
		_ => 0,
	}
}

impl DateRange {
	pub(crate) fn from_json(node: &Value) -> DateRange {
		DateRange {
			start: string(node, "start-datetime").unwrap_or_default(),
			end: string(node, "end-datetime").unwrap_or_default(),
		}
	}
}

impl Policy {
	pub(crate) fn from_json(node: &Value) -> Policy {
		let descriptor = node.get("policy").unwrap_or(&NULL);
		let summary = node.get("summary").unwrap_or(&NULL);

		let failure_details = match node.get("failure-details") {
			None | Some(Value::Null) => None,
			Some(Value::Array(details)) => Some(details.iter().map(FailureDetail::from_json).collect()),
			Some(single) => Some(vec![FailureDetail::from_json(single)]),
		};

		Policy {
			policy_type: string(descriptor, "policy-type").unwrap_or_default(),
			policy_domain: string(descriptor, "policy-domain").unwrap_or_default(),
			policy_strings: strings(descriptor, "policy-string"),
			mx_hosts: strings(descriptor, "mx-host"),
			summary: Summary {
				success_count: count(summary, "total-successful-session-count"),
				failure_count: count(summary, "total-failure-session-count"),
			},
			failure_details,
		}
	}
}

impl FailureDetail {
	pub(crate) fn from_json(node: &Value) -> FailureDetail {
		FailureDetail {
			result_type: string(node, "result-type").unwrap_or_default(),
			sending_mta_ip: string(node, "sending-mta-ip"),
			receiving_mx_hostname: string(node, "receiving-mx-hostname"),
			receiving_ip: string(node, "receiving-ip"),
			failed_session_count: count(node, "failed-session-count"),
			failure_reason_code: string(node, "failure-reason-code"),
			additional_information: string(node, "additional-information"),
		}
	}
}
