use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use simple_error::SimpleError;
use tracing::info;

use crate::ingest::IngestConfig;
use crate::queue::QueueConfig;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
	#[serde(default)]
	pub queue: QueueConfig,

	#[serde(default)]
	pub ingest: IngestConfig,
}

impl Config {
	/// Reads the config at `path`, writing out the defaults first if there
	/// isn't one yet.
	pub fn load(path: &Path) -> Result<Config, SimpleError> {
		if !path.exists() {
			info!(path = %path.display(), "Could not find config, creating default");
			let text = toml::to_string(&Config::default()).map_err(|e| SimpleError::with("Could not encode default config", e))?;
			fs::write(path, text).map_err(|e| SimpleError::with("Could not write config file", e))?;
		}

		let text = fs::read_to_string(path).map_err(|e| SimpleError::with("Could not read config file", e))?;
		toml::from_str(&text).map_err(|e| SimpleError::with("Could not parse config file", e))
	}
}
