use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use report_intake::ingest::{JsonLinesSink, MultiSink, TracingSink};
use report_intake::{logging, Attachment, Config, Ingested, Ingestor};

/// Reads DMARC aggregate and SMTP TLS report files and prints each one as a
/// line of JSON.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
	/// Config file; created with defaults if it doesn't exist.
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Report files (.xml, .json, .gz or .zip).
	#[arg(required = true)]
	files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
	let args = Args::parse();
	logging::init();

	let config = match Config::load(&args.config) {
		Ok(config) => config,
		Err(e) => {
			error!(path = %args.config.display(), error = %e, "Could not load config");
			return ExitCode::FAILURE;
		}
	};

	let sink = MultiSink::new()
		.with(Arc::new(TracingSink))
		.with(Arc::new(JsonLinesSink::new(io::stdout())));
	let ingestor = Ingestor::new(config.ingest, Arc::new(sink));

	let mut failed = 0;
	for path in &args.files {
		let data = match fs::read(path) {
			Ok(data) => data,
			Err(e) => {
				error!(path = %path.display(), error = %e, "Could not read report file");
				failed += 1;
				continue;
			}
		};

		let attachment = Attachment {
			file_name: path.file_name().map(|name| name.to_string_lossy().into_owned()),
			data,
			..Default::default()
		};

		match ingestor.ingest(attachment, None).await {
			Ok(Ingested::Skipped) => {
				error!(path = %path.display(), "No usable report in file");
				failed += 1;
			}
			Ok(_) => {}
			Err(e) => {
				error!(path = %path.display(), error = %e, "Could not ingest report file");
				failed += 1;
			}
		}
	}

	info!(files = args.files.len(), failed, "Done");
	if failed > 0 {
		ExitCode::FAILURE
	} else {
		ExitCode::SUCCESS
	}
}
