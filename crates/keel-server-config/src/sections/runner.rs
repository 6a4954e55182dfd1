// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Worker coordinator configuration section.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfigLayer {
	pub max_processes: Option<u64>,
	pub max_memory_percent: Option<f64>,
	pub max_load_per_cpu: Option<f64>,
	pub tick_interval_secs: Option<u64>,
	pub worker_command: Option<String>,
}

impl RunnerConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.max_processes.is_some() {
			self.max_processes = other.max_processes;
		}
		if other.max_memory_percent.is_some() {
			self.max_memory_percent = other.max_memory_percent;
		}
		if other.max_load_per_cpu.is_some() {
			self.max_load_per_cpu = other.max_load_per_cpu;
		}
		if other.tick_interval_secs.is_some() {
			self.tick_interval_secs = other.tick_interval_secs;
		}
		if other.worker_command.is_some() {
			self.worker_command = other.worker_command;
		}
	}

	pub fn finalize(self) -> Result<RunnerConfig, ConfigError> {
		let defaults = RunnerConfig::default();
		let config = RunnerConfig {
			max_processes: self.max_processes.unwrap_or(defaults.max_processes),
			max_memory_percent: self
				.max_memory_percent
				.unwrap_or(defaults.max_memory_percent),
			max_load_per_cpu: self.max_load_per_cpu.unwrap_or(defaults.max_load_per_cpu),
			tick_interval_secs: self
				.tick_interval_secs
				.unwrap_or(defaults.tick_interval_secs),
			worker_command: self.worker_command.map(PathBuf::from),
		};

		if !(config.max_memory_percent > 0.0 && config.max_memory_percent <= 100.0) {
			return Err(ConfigError::InvalidValue {
				key: "runner.max_memory_percent".to_string(),
				message: format!("{} is outside (0, 100]", config.max_memory_percent),
			});
		}
		if !(config.max_load_per_cpu > 0.0 && config.max_load_per_cpu.is_finite()) {
			return Err(ConfigError::InvalidValue {
				key: "runner.max_load_per_cpu".to_string(),
				message: format!("{} must be a positive number", config.max_load_per_cpu),
			});
		}
		if config.tick_interval_secs == 0 {
			return Err(ConfigError::InvalidValue {
				key: "runner.tick_interval_secs".to_string(),
				message: "must be at least 1".to_string(),
			});
		}

		Ok(config)
	}
}

/// Resolved coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
	pub max_processes: u64,
	pub max_memory_percent: f64,
	pub max_load_per_cpu: f64,
	pub tick_interval_secs: u64,
	/// Program spawned for each worker; the running executable when unset.
	pub worker_command: Option<PathBuf>,
}

impl Default for RunnerConfig {
	fn default() -> Self {
		Self {
			max_processes: 4,
			max_memory_percent: 90.0,
			max_load_per_cpu: 2.0,
			tick_interval_secs: 5,
			worker_command: None,
		}
	}
}
