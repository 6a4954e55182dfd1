// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: environment variables and TOML files.

use std::path::PathBuf;

use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::layer::ServerConfigLayer;
use crate::sections::{DatabaseConfigLayer, JobsConfigLayer, LoggingConfigLayer, RunnerConfigLayer};

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

/// Trait for configuration sources.
pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<ServerConfigLayer, ConfigError>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(ServerConfigLayer::default())
	}
}

/// TOML file configuration source.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new("/etc/keel/server.toml")
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(ServerConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: ServerConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: KEEL_SERVER_<SECTION>_<FIELD>
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(ServerConfigLayer {
			database: Some(load_database_from_env()?),
			jobs: Some(load_jobs_from_env()?),
			runner: Some(load_runner_from_env()?),
			logging: Some(load_logging_from_env()),
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str, kind: &str) -> Result<Option<T>, ConfigError> {
	match env_var(name) {
		Some(v) => v.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid {kind} value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn env_u32(name: &str) -> Result<Option<u32>, ConfigError> {
	env_parsed(name, "u32")
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
	env_parsed(name, "u64")
}

fn env_f64(name: &str) -> Result<Option<f64>, ConfigError> {
	env_parsed(name, "f64")
}

/// Comma-separated, or a JSON array of strings.
fn env_list(name: &str) -> Result<Option<Vec<String>>, ConfigError> {
	let Some(value) = env_var(name) else {
		return Ok(None);
	};
	if value.trim_start().starts_with('[') {
		return serde_json::from_str(&value)
			.map(Some)
			.map_err(|e| ConfigError::InvalidValue {
				key: name.to_string(),
				message: format!("invalid JSON list: {e}"),
			});
	}
	Ok(Some(
		value
			.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect(),
	))
}

fn load_database_from_env() -> Result<DatabaseConfigLayer, ConfigError> {
	Ok(DatabaseConfigLayer {
		url: env_var("KEEL_SERVER_DATABASE_URL"),
		max_connections: env_u32("KEEL_SERVER_DATABASE_MAX_CONNECTIONS")?,
		busy_timeout_secs: env_u64("KEEL_SERVER_DATABASE_BUSY_TIMEOUT_SECS")?,
		wal: env_parsed("KEEL_SERVER_DATABASE_WAL", "bool")?,
	})
}

fn load_jobs_from_env() -> Result<JobsConfigLayer, ConfigError> {
	Ok(JobsConfigLayer {
		stall_threshold: env_u32("KEEL_SERVER_JOB_STALL_THRESHOLD")?,
		max_retry_attempts: env_u32("KEEL_SERVER_JOB_MAX_RETRY_ATTEMPTS")?,
		retry_allow_list: env_list("KEEL_SERVER_JOB_RETRY_ALLOW_LIST")?,
		memory_limit_mb: env_u64("KEEL_SERVER_JOB_MEMORY_LIMIT_MB")?,
		time_limit_secs: env_u64("KEEL_SERVER_JOB_TIME_LIMIT_SECS")?,
		health_check_interval_secs: env_u64("KEEL_SERVER_JOB_HEALTH_CHECK_INTERVAL_SECS")?,
		lock_ttl_secs: env_u64("KEEL_SERVER_JOB_LOCK_TTL_SECS")?,
		finished_retention_days: env_u32("KEEL_SERVER_JOB_FINISHED_RETENTION_DAYS")?,
	})
}

fn load_runner_from_env() -> Result<RunnerConfigLayer, ConfigError> {
	Ok(RunnerConfigLayer {
		max_processes: env_u64("KEEL_SERVER_RUNNER_MAX_PROCESSES")?,
		max_memory_percent: env_f64("KEEL_SERVER_RUNNER_MAX_MEMORY_PERCENT")?,
		max_load_per_cpu: env_f64("KEEL_SERVER_RUNNER_MAX_LOAD_PER_CPU")?,
		tick_interval_secs: env_u64("KEEL_SERVER_RUNNER_TICK_INTERVAL_SECS")?,
		worker_command: env_var("KEEL_SERVER_RUNNER_WORKER_COMMAND"),
	})
}

fn load_logging_from_env() -> LoggingConfigLayer {
	LoggingConfigLayer {
		level: env_var("KEEL_SERVER_LOG_LEVEL"),
		format: env_var("KEEL_SERVER_LOG_FORMAT"),
	}
}
