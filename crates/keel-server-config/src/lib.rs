// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Centralized configuration management for Keel server.
//!
//! This crate provides:
//! - Layered configuration from multiple sources (defaults, TOML file, environment)
//! - Type-safe configuration with validation
//! - Consistent environment variable naming (`KEEL_SERVER_*`)
//!
//! # Usage
//!
//! ```ignore
//! use keel_server_config::load_config;
//!
//! let config = load_config()?;
//! println!("Jobs stored in {}", config.database.url);
//! ```

pub mod error;
pub mod layer;
pub mod sections;
pub mod sources;

pub use error::ConfigError;
pub use layer::ServerConfigLayer;
pub use sections::*;
pub use sources::{ConfigSource, DefaultsSource, EnvSource, Precedence, TomlSource};

use tracing::{debug, info};

/// Fully resolved server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub database: DatabaseConfig,
	pub jobs: JobsConfig,
	pub runner: RunnerConfig,
	pub logging: LoggingConfig,
}

/// Load configuration from all sources with standard precedence.
///
/// Precedence (highest to lowest):
/// 1. Environment variables (`KEEL_SERVER_*`)
/// 2. Config file (`/etc/keel/server.toml`)
/// 3. Built-in defaults
pub fn load_config() -> Result<ServerConfig, ConfigError> {
	load_from(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::system()),
		Box::new(EnvSource),
	])
}

/// Load configuration from environment only (for testing or simple deployments).
pub fn load_config_from_env() -> Result<ServerConfig, ConfigError> {
	let mut merged = ServerConfigLayer::default();
	merged.merge(EnvSource.load()?);
	finalize(merged)
}

/// Load configuration with a custom config file path.
pub fn load_config_with_file(
	config_path: impl Into<std::path::PathBuf>,
) -> Result<ServerConfig, ConfigError> {
	load_from(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::new(config_path)),
		Box::new(EnvSource),
	])
}

fn load_from(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<ServerConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = ServerConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		let layer = source.load()?;
		merged.merge(layer);
	}

	finalize(merged)
}

/// Finalize configuration layer into resolved config.
fn finalize(layer: ServerConfigLayer) -> Result<ServerConfig, ConfigError> {
	let database = layer.database.unwrap_or_default().finalize()?;
	let jobs = layer.jobs.unwrap_or_default().finalize()?;
	let runner = layer.runner.unwrap_or_default().finalize()?;
	let logging = layer.logging.unwrap_or_default().finalize()?;

	validate_config(&jobs, &runner)?;

	info!(
		database = %database.url,
		db_max_connections = database.max_connections,
		stall_threshold = jobs.stall_threshold,
		max_retry_attempts = jobs.max_retry_attempts,
		max_processes = runner.max_processes,
		log_format = %logging.format,
		"Server configuration loaded"
	);

	Ok(ServerConfig {
		database,
		jobs,
		runner,
		logging,
	})
}

/// Validate cross-field configuration rules.
fn validate_config(jobs: &JobsConfig, runner: &RunnerConfig) -> Result<(), ConfigError> {
	// A lease must outlive at least one coordinator tick or every worker
	// would be reclaimed while still running.
	if jobs.lock_ttl_secs <= runner.tick_interval_secs {
		return Err(ConfigError::Validation(format!(
			"jobs.lock_ttl_secs ({}) must be greater than runner.tick_interval_secs ({})",
			jobs.lock_ttl_secs, runner.tick_interval_secs
		)));
	}

	Ok(())
}
