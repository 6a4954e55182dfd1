// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

/// Tunables shared by the run loop, health monitor and retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
	/// Health sweeps without progress before a job is paused instead of
	/// restarted. Also bounds consecutive no-progress steps inside one run.
	pub stall_threshold: u32,
	pub max_retry_attempts: u32,
	/// Implementations allowed to be retried after a failure.
	pub retry_allow_list: Vec<String>,
	/// Resident memory of the runner process above which a run suspends.
	pub memory_limit_bytes: Option<u64>,
	/// Wall time of a single run above which it suspends.
	pub time_limit: Option<Duration>,
	/// Lease length for handed-off descriptors; must exceed the longest step.
	pub lock_ttl: Duration,
}

impl Default for EngineSettings {
	fn default() -> Self {
		Self {
			stall_threshold: 3,
			max_retry_attempts: 3,
			retry_allow_list: Vec::new(),
			memory_limit_bytes: Some(256 * 1024 * 1024),
			time_limit: Some(Duration::from_secs(300)),
			lock_ttl: Duration::from_secs(600),
		}
	}
}

impl EngineSettings {
	pub fn lock_ttl_chrono(&self) -> chrono::Duration {
		chrono::Duration::from_std(self.lock_ttl).unwrap_or_else(|_| chrono::Duration::minutes(10))
	}
}
