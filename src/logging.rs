use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::FilterFn, prelude::*, Layer};

/// Sets up the global subscriber. The level comes from `LOG_LEVEL`, falling
/// back to `TRACE` in debug builds and `INFO` otherwise.
///
/// Logs go to stderr so stdout stays free for report output.
pub fn init() {
	let default = if cfg!(debug_assertions) {
		LevelFilter::TRACE
	} else {
		LevelFilter::INFO
	};

	let level = std::env::var("LOG_LEVEL").map_or(default, |level| {
		LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
			eprintln!("Invalid log level specified {level}, defaulting to {default}");
			default
		})
	});

	tracing_subscriber::Registry::default()
		.with(
			tracing_subscriber::fmt::layer()
				.with_writer(std::io::stderr)
				.with_file(false)
				.with_line_number(false)
				.compact()
				.with_ansi(true)
				.with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
				.with_filter(level)
				.with_filter(FilterFn::new(|metadata| {
					metadata.target().starts_with("report_intake")
				})),
		)
		.init();
}
