// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Descriptor store connection section.
//!
//! The coordinator and every worker process open the same SQLite file, so
//! the journal mode, lock wait and pool size are tunable here rather than
//! fixed in the pool constructor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_URL: &str = "sqlite:./keel.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
	pub url: String,
	pub max_connections: u32,
	/// How long a connection waits on a locked database before failing.
	pub busy_timeout_secs: u64,
	/// Write-ahead logging with `synchronous = NORMAL`; rollback journal with
	/// `synchronous = FULL` when off.
	pub wal: bool,
}

impl DatabaseConfig {
	pub fn busy_timeout(&self) -> Duration {
		Duration::from_secs(self.busy_timeout_secs)
	}
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		Self {
			url: DEFAULT_URL.to_string(),
			max_connections: 5,
			busy_timeout_secs: 5,
			wal: true,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfigLayer {
	pub url: Option<String>,
	pub max_connections: Option<u32>,
	pub busy_timeout_secs: Option<u64>,
	pub wal: Option<bool>,
}

impl DatabaseConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.url.is_some() {
			self.url = other.url;
		}
		if other.max_connections.is_some() {
			self.max_connections = other.max_connections;
		}
		if other.busy_timeout_secs.is_some() {
			self.busy_timeout_secs = other.busy_timeout_secs;
		}
		if other.wal.is_some() {
			self.wal = other.wal;
		}
	}

	pub fn finalize(self) -> Result<DatabaseConfig, ConfigError> {
		let defaults = DatabaseConfig::default();
		let config = DatabaseConfig {
			url: self.url.unwrap_or(defaults.url),
			max_connections: self.max_connections.unwrap_or(defaults.max_connections),
			busy_timeout_secs: self
				.busy_timeout_secs
				.unwrap_or(defaults.busy_timeout_secs),
			wal: self.wal.unwrap_or(defaults.wal),
		};

		if !config.url.starts_with("sqlite:") {
			return Err(ConfigError::InvalidValue {
				key: "database.url".to_string(),
				message: format!("'{}' is not a sqlite: URL", config.url),
			});
		}
		if config.max_connections == 0 {
			return Err(ConfigError::InvalidValue {
				key: "database.max_connections".to_string(),
				message: "must be at least 1".to_string(),
			});
		}

		Ok(config)
	}
}
