use serde::{Deserialize, Serialize};

/// Disposition used when a report does not publish one.
pub const DEFAULT_POLICY: &str = "none";

/// A DMARC aggregate report, reduced to what gets stored.
///
/// The counters are sums over every DKIM/SPF auth result of every record in
/// the report. Only `pass`, `fail` and `temperror` are tracked.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateReport {
	pub report_id: String,
	pub org_name: String,
	/// The domain the published policy applies to.
	pub domain: String,
	/// Start of the reporting window, in seconds since the Unix epoch.
	pub begin_date: i64,
	/// End of the reporting window, in seconds since the Unix epoch.
	pub end_date: i64,
	pub dkim_pass: u64,
	pub dkim_fail: u64,
	pub dkim_temperror: u64,
	pub spf_pass: u64,
	pub spf_fail: u64,
	pub spf_temperror: u64,
	/// Published disposition: `none`, `quarantine` or `reject`.
	pub policy_p: String,
	/// The report exactly as it was received.
	pub raw_xml: String,
}

/// Running count of the auth results we care about.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResultTally {
	pub pass: u64,
	pub fail: u64,
	pub temperror: u64,
}

impl ResultTally {
	/// Counts one auth result. Anything other than `pass`, `fail` or
	/// `temperror` (case-insensitive) is ignored.
	pub fn record(&mut self, result: Option<&str>) {
		let result = match result {
			Some(result) => result.trim().to_lowercase(),
			None => return,
		};

		match result.as_str() {
			"pass" => self.pass += 1,
			"fail" => self.fail += 1,
			"temperror" => self.temperror += 1,
			_ => {}
		}
	}
}
