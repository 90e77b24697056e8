//! Configuration file support for kdeps.
//!
//! A YAML file given with `--config` holds the same settings as the command line,
//! plus a list of dependencies. Command line values take precedence.

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

use crate::dependency::{RetryBudget, RetryBudgetError};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KdepsConfig {
	/// Namespace used by dependencies that don't name one.
	#[serde(default)]
	pub namespace: Option<String>,

	#[serde(default)]
	pub max_retry: Option<MaxRetry>,

	#[serde(default)]
	pub keep_on_error: bool,

	#[serde(default)]
	pub ignore_error: bool,

	#[serde(default)]
	pub verbose: bool,

	/// Pause between passes, in humantime syntax (`10s`, `1m 30s`).
	#[serde(default, deserialize_with = "humantime_opt")]
	pub sleep: Option<Duration>,

	/// Overall deadline, in humantime syntax.
	#[serde(default, deserialize_with = "humantime_opt")]
	pub timeout: Option<Duration>,

	#[serde(default)]
	pub dependencies: Vec<String>,
}

/// `maxRetry` accepts both `maxRetry: 5` and `maxRetry: always`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MaxRetry {
	Count(i64),
	Text(String),
}

impl MaxRetry {
	pub fn budget(&self) -> Result<RetryBudget, RetryBudgetError> {
		match self {
			MaxRetry::Count(n) => Ok(RetryBudget::Limited(*n)),
			MaxRetry::Text(text) => text.parse(),
		}
	}
}

fn humantime_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
	D: Deserializer<'de>,
{
	Option::<String>::deserialize(deserializer)?
		.map(|text| humantime::parse_duration(&text).map_err(serde::de::Error::custom))
		.transpose()
}

impl KdepsConfig {
	/// Load config from a specific file path
	pub fn load_from_file(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path)
			.with_context(|| format!("failed to read config file: {}", path.display()))?;
		let config: KdepsConfig = serde_yaml_with_quirks::from_str(&content)
			.with_context(|| format!("failed to parse config file: {}", path.display()))?;
		Ok(config)
	}
}
