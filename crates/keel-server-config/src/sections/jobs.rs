// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job engine configuration section.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobsConfigLayer {
	pub stall_threshold: Option<u32>,
	pub max_retry_attempts: Option<u32>,
	pub retry_allow_list: Option<Vec<String>>,
	pub memory_limit_mb: Option<u64>,
	pub time_limit_secs: Option<u64>,
	pub health_check_interval_secs: Option<u64>,
	pub lock_ttl_secs: Option<u64>,
	pub finished_retention_days: Option<u32>,
}

impl JobsConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.stall_threshold.is_some() {
			self.stall_threshold = other.stall_threshold;
		}
		if other.max_retry_attempts.is_some() {
			self.max_retry_attempts = other.max_retry_attempts;
		}
		if other.retry_allow_list.is_some() {
			self.retry_allow_list = other.retry_allow_list;
		}
		if other.memory_limit_mb.is_some() {
			self.memory_limit_mb = other.memory_limit_mb;
		}
		if other.time_limit_secs.is_some() {
			self.time_limit_secs = other.time_limit_secs;
		}
		if other.health_check_interval_secs.is_some() {
			self.health_check_interval_secs = other.health_check_interval_secs;
		}
		if other.lock_ttl_secs.is_some() {
			self.lock_ttl_secs = other.lock_ttl_secs;
		}
		if other.finished_retention_days.is_some() {
			self.finished_retention_days = other.finished_retention_days;
		}
	}

	pub fn finalize(self) -> Result<JobsConfig, ConfigError> {
		let defaults = JobsConfig::default();
		let config = JobsConfig {
			stall_threshold: self.stall_threshold.unwrap_or(defaults.stall_threshold),
			max_retry_attempts: self
				.max_retry_attempts
				.unwrap_or(defaults.max_retry_attempts),
			retry_allow_list: self.retry_allow_list.unwrap_or_default(),
			memory_limit_mb: self.memory_limit_mb.unwrap_or(defaults.memory_limit_mb),
			time_limit_secs: self.time_limit_secs.unwrap_or(defaults.time_limit_secs),
			health_check_interval_secs: self
				.health_check_interval_secs
				.unwrap_or(defaults.health_check_interval_secs),
			lock_ttl_secs: self.lock_ttl_secs.unwrap_or(defaults.lock_ttl_secs),
			finished_retention_days: self
				.finished_retention_days
				.unwrap_or(defaults.finished_retention_days),
		};

		if config.stall_threshold == 0 {
			return Err(ConfigError::InvalidValue {
				key: "jobs.stall_threshold".to_string(),
				message: "must be at least 1".to_string(),
			});
		}
		if config.health_check_interval_secs == 0 {
			return Err(ConfigError::InvalidValue {
				key: "jobs.health_check_interval_secs".to_string(),
				message: "must be at least 1".to_string(),
			});
		}
		if config.lock_ttl_secs == 0 {
			return Err(ConfigError::InvalidValue {
				key: "jobs.lock_ttl_secs".to_string(),
				message: "must be at least 1".to_string(),
			});
		}

		Ok(config)
	}
}

/// Resolved job engine settings. A zero memory or time limit disables that
/// budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
	pub stall_threshold: u32,
	pub max_retry_attempts: u32,
	pub retry_allow_list: Vec<String>,
	pub memory_limit_mb: u64,
	pub time_limit_secs: u64,
	pub health_check_interval_secs: u64,
	pub lock_ttl_secs: u64,
	pub finished_retention_days: u32,
}

impl JobsConfig {
	pub fn memory_limit_bytes(&self) -> Option<u64> {
		(self.memory_limit_mb > 0).then(|| self.memory_limit_mb * 1024 * 1024)
	}

	pub fn time_limit(&self) -> Option<std::time::Duration> {
		(self.time_limit_secs > 0).then(|| std::time::Duration::from_secs(self.time_limit_secs))
	}
}

impl Default for JobsConfig {
	fn default() -> Self {
		Self {
			stall_threshold: 3,
			max_retry_attempts: 3,
			retry_allow_list: Vec::new(),
			memory_limit_mb: 256,
			time_limit_secs: 300,
			health_check_interval_secs: 300,
			lock_ttl_secs: 600,
			finished_retention_days: 30,
		}
	}
}
