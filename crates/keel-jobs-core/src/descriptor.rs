// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The persisted job descriptor and its status/lane enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use crate::message::JobMessage;
use crate::progress::JobProgress;

/// Identifier of a job descriptor.
///
/// Ids are assigned by the store in insertion order, so the lowest id in a
/// lane is always the oldest descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DescriptorId(pub i64);

impl fmt::Display for DescriptorId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for DescriptorId {
	type Err = ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

/// Scheduling partition. Each lane runs independently of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
	/// Short jobs that should start as soon as the current request batch ends.
	Immediate,
	Standard,
	/// Long or heavy jobs isolated from the standard lane.
	Large,
}

impl Lane {
	/// All lanes in dispatch priority order.
	pub const ALL: [Lane; 3] = [Lane::Immediate, Lane::Standard, Lane::Large];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Immediate => "immediate",
			Self::Standard => "standard",
			Self::Large => "large",
		}
	}
}

impl fmt::Display for Lane {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Lane {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"immediate" => Ok(Self::Immediate),
			"standard" => Ok(Self::Standard),
			"large" => Ok(Self::Large),
			_ => Err(format!("unknown lane: {s}")),
		}
	}
}

/// Lifecycle status of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	New,
	Initializing,
	Running,
	/// Suspended at a checkpoint; picked up again ahead of new work.
	Waiting,
	Paused,
	Cancelled,
	Broken,
	Complete,
}

impl JobStatus {
	/// Statuses a runner may claim from.
	pub const CLAIMABLE: &'static [JobStatus] = &[JobStatus::New, JobStatus::Waiting];

	/// Statuses that mean a runner currently owns the descriptor.
	pub const ACTIVE: &'static [JobStatus] = &[JobStatus::Initializing, JobStatus::Running];

	/// Statuses used for enqueue de-duplication.
	pub const UNSTARTED: &'static [JobStatus] = &[JobStatus::New, JobStatus::Initializing];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::New => "new",
			Self::Initializing => "initializing",
			Self::Running => "running",
			Self::Waiting => "waiting",
			Self::Paused => "paused",
			Self::Cancelled => "cancelled",
			Self::Broken => "broken",
			Self::Complete => "complete",
		}
	}

	pub fn is_active(&self) -> bool {
		Self::ACTIVE.contains(self)
	}

	pub fn is_claimable(&self) -> bool {
		Self::CLAIMABLE.contains(self)
	}

	/// Complete and Cancelled descriptors never run again.
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Complete | Self::Cancelled)
	}
}

impl fmt::Display for JobStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for JobStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"new" => Ok(Self::New),
			"initializing" => Ok(Self::Initializing),
			"running" => Ok(Self::Running),
			"waiting" => Ok(Self::Waiting),
			"paused" => Ok(Self::Paused),
			"cancelled" => Ok(Self::Cancelled),
			"broken" => Ok(Self::Broken),
			"complete" => Ok(Self::Complete),
			_ => Err(format!("unknown job status: {s}")),
		}
	}
}

/// Persisted record for one queued or running job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
	pub id: DescriptorId,
	pub signature: String,
	/// Registry name used to rebuild the job on resume.
	pub implementation: String,
	pub title: String,
	pub lane: Lane,
	pub status: JobStatus,
	pub start_after: Option<DateTime<Utc>>,

	pub started: Option<DateTime<Utc>>,
	pub restarted: Option<DateTime<Utc>>,
	pub finished: Option<DateTime<Utc>>,

	pub total_steps: i64,
	pub steps_processed: i64,
	/// Health-sweep snapshot of `steps_processed`; -1 until the first sweep.
	pub last_processed_count: i64,
	pub resume_count: u32,
	pub failed_attempts: u32,

	pub saved_state: serde_json::Value,
	pub saved_messages: Vec<JobMessage>,
	pub run_as: Option<String>,

	pub lock_owner: Option<String>,
	pub lock_expiry: Option<DateTime<Utc>>,
	pub scratch_ref: Option<String>,

	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl JobDescriptor {
	/// Rebuild the progress counters a job resumes from.
	pub fn progress(&self) -> JobProgress {
		JobProgress::resume(
			self.total_steps,
			self.steps_processed,
			self.saved_messages.clone(),
			self.scratch_ref.clone(),
		)
	}

	/// Whether this descriptor has run before (setup already happened).
	pub fn has_progress(&self) -> bool {
		self.steps_processed > 0
	}

	pub fn is_leased(&self) -> bool {
		self.lock_owner.is_some()
	}

	pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
		matches!(self.lock_expiry, Some(expiry) if expiry < now)
	}

	/// Eligible for pickup at `now` as far as the start delay is concerned.
	pub fn is_due(&self, now: DateTime<Utc>) -> bool {
		self.start_after.map_or(true, |at| at <= now)
	}
}

/// Everything needed to insert a descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDescriptor {
	pub signature: String,
	pub implementation: String,
	pub title: String,
	pub lane: Lane,
	pub start_after: Option<DateTime<Utc>>,
	pub total_steps: i64,
	pub saved_state: serde_json::Value,
	pub saved_messages: Vec<JobMessage>,
	pub run_as: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;

	pub(crate) fn sample_descriptor() -> JobDescriptor {
		let now = Utc::now();
		JobDescriptor {
			id: DescriptorId(7),
			signature: "abc".to_string(),
			implementation: "sample".to_string(),
			title: "Sample".to_string(),
			lane: Lane::Standard,
			status: JobStatus::New,
			start_after: None,
			started: None,
			restarted: None,
			finished: None,
			total_steps: 4,
			steps_processed: 2,
			last_processed_count: -1,
			resume_count: 0,
			failed_attempts: 0,
			saved_state: serde_json::json!({"cursor": 2}),
			saved_messages: Vec::new(),
			run_as: None,
			lock_owner: None,
			lock_expiry: None,
			scratch_ref: None,
			created_at: now,
			updated_at: now,
		}
	}

	#[test]
	fn test_status_roundtrip() {
		for status in [
			JobStatus::New,
			JobStatus::Initializing,
			JobStatus::Running,
			JobStatus::Waiting,
			JobStatus::Paused,
			JobStatus::Cancelled,
			JobStatus::Broken,
			JobStatus::Complete,
		] {
			assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
		}
		assert!("queued".parse::<JobStatus>().is_err());
	}

	#[test]
	fn test_status_groups() {
		assert!(JobStatus::New.is_claimable());
		assert!(JobStatus::Waiting.is_claimable());
		assert!(!JobStatus::Paused.is_claimable());
		assert!(JobStatus::Running.is_active());
		assert!(JobStatus::Initializing.is_active());
		assert!(!JobStatus::Waiting.is_active());
		assert!(JobStatus::Complete.is_terminal());
		assert!(!JobStatus::Broken.is_terminal());
	}

	#[test]
	fn test_lane_parse_and_order() {
		assert_eq!("large".parse::<Lane>(), Ok(Lane::Large));
		assert!("urgent".parse::<Lane>().is_err());
		assert_eq!(Lane::ALL[0], Lane::Immediate);
		assert_eq!(Lane::Standard.to_string(), "standard");
	}

	#[test]
	fn test_descriptor_id_parse() {
		assert_eq!("42".parse::<DescriptorId>().unwrap(), DescriptorId(42));
		assert!("x".parse::<DescriptorId>().is_err());
	}

	#[test]
	fn test_progress_resumes_from_counters() {
		let descriptor = sample_descriptor();
		let progress = descriptor.progress();
		assert_eq!(progress.total_steps, 4);
		assert_eq!(progress.current_step, 2);
		assert!(!progress.is_finished());
		assert!(descriptor.has_progress());
	}

	#[test]
	fn test_is_due() {
		let now = Utc::now();
		let mut descriptor = sample_descriptor();
		assert!(descriptor.is_due(now));

		descriptor.start_after = Some(now + Duration::minutes(5));
		assert!(!descriptor.is_due(now));

		descriptor.start_after = Some(now - Duration::seconds(1));
		assert!(descriptor.is_due(now));
	}

	#[test]
	fn test_lease_expired() {
		let now = Utc::now();
		let mut descriptor = sample_descriptor();
		assert!(!descriptor.lease_expired(now));

		descriptor.lock_owner = Some("worker-1".to_string());
		descriptor.lock_expiry = Some(now - Duration::seconds(30));
		assert!(descriptor.is_leased());
		assert!(descriptor.lease_expired(now));
	}
}
