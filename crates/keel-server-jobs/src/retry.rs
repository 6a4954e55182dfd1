// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Failure retry with tiered, jittered backoff.

use std::ops::RangeInclusive;

use chrono::{DateTime, Duration, Utc};
use keel_jobs_core::JobDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
	NotRetryable,
	AttemptsExhausted { max_attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
	Requeue {
		failed_attempts: u32,
		start_after: DateTime<Utc>,
	},
	GiveUp(GiveUpReason),
}

/// Delay window in seconds for the given (1-based) retry attempt.
pub fn backoff_window(attempt: u32) -> RangeInclusive<u64> {
	match attempt {
		0 | 1 => 10..=60,
		2 => 60..=240,
		3 => 240..=600,
		4 => 600..=1800,
		_ => 1800..=3600,
	}
}

pub fn backoff_delay(attempt: u32) -> Duration {
	let secs = fastrand::u64(backoff_window(attempt));
	Duration::seconds(secs as i64)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub allow_list: Vec<String>,
}

impl RetryPolicy {
	pub fn new(max_attempts: u32, allow_list: Vec<String>) -> Self {
		Self {
			max_attempts,
			allow_list,
		}
	}

	pub fn is_retryable(&self, implementation: &str) -> bool {
		self.allow_list.iter().any(|name| name == implementation)
	}

	/// Decide what happens to a descriptor that just failed.
	pub fn decide(&self, descriptor: &JobDescriptor, now: DateTime<Utc>) -> RetryDecision {
		if !self.is_retryable(&descriptor.implementation) {
			return RetryDecision::GiveUp(GiveUpReason::NotRetryable);
		}

		let attempt = descriptor.failed_attempts.saturating_add(1);
		if attempt > self.max_attempts {
			return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted {
				max_attempts: self.max_attempts,
			});
		}

		RetryDecision::Requeue {
			failed_attempts: attempt,
			start_after: now + backoff_delay(attempt),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use keel_jobs_core::{DescriptorId, JobStatus, Lane};
	use proptest::prelude::*;

	fn failed(implementation: &str, failed_attempts: u32) -> JobDescriptor {
		let now = Utc::now();
		JobDescriptor {
			id: DescriptorId(1),
			signature: "sig".to_string(),
			implementation: implementation.to_string(),
			title: "Failing".to_string(),
			lane: Lane::Standard,
			status: JobStatus::Broken,
			start_after: None,
			started: Some(now),
			restarted: None,
			finished: None,
			total_steps: 0,
			steps_processed: 0,
			last_processed_count: -1,
			resume_count: 0,
			failed_attempts,
			saved_state: serde_json::Value::Null,
			saved_messages: Vec::new(),
			run_as: None,
			lock_owner: None,
			lock_expiry: None,
			scratch_ref: None,
			created_at: now,
			updated_at: now,
		}
	}

	fn policy() -> RetryPolicy {
		RetryPolicy::new(3, vec!["sync".to_string()])
	}

	#[test]
	fn test_not_on_allow_list_gives_up() {
		assert_eq!(
			policy().decide(&failed("export", 0), Utc::now()),
			RetryDecision::GiveUp(GiveUpReason::NotRetryable)
		);
	}

	#[test]
	fn test_requeues_until_max_attempts() {
		let now = Utc::now();
		for previous in 0..3 {
			match policy().decide(&failed("sync", previous), now) {
				RetryDecision::Requeue {
					failed_attempts,
					start_after,
				} => {
					assert_eq!(failed_attempts, previous + 1);
					let window = backoff_window(previous + 1);
					let delay = (start_after - now).num_seconds() as u64;
					assert!(window.contains(&delay));
				}
				other => panic!("expected requeue, got {other:?}"),
			}
		}

		assert_eq!(
			policy().decide(&failed("sync", 3), now),
			RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted { max_attempts: 3 })
		);
	}

	#[test]
	fn test_zero_max_attempts_never_retries() {
		let policy = RetryPolicy::new(0, vec!["sync".to_string()]);
		assert!(matches!(
			policy.decide(&failed("sync", 0), Utc::now()),
			RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted { .. })
		));
	}

	#[test]
	fn test_windows_grow() {
		assert_eq!(backoff_window(1), 10..=60);
		assert_eq!(backoff_window(2), 60..=240);
		assert_eq!(backoff_window(3), 240..=600);
		assert_eq!(backoff_window(4), 600..=1800);
		assert_eq!(backoff_window(9), 1800..=3600);
	}

	proptest! {
		#[test]
		fn prop_backoff_delay_within_tier(attempt in 1u32..12) {
			let window = backoff_window(attempt);
			let delay = backoff_delay(attempt).num_seconds() as u64;
			prop_assert!(window.contains(&delay));
		}
	}
}
