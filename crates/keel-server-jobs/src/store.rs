// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Descriptor store contract.
//!
//! Every status change the engine makes goes through a conditional update
//! here; the store is the only shared state between runners, so the boolean
//! returned by the `transition`/`claim` family is the engine's mutex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_jobs_core::{DescriptorId, JobDescriptor, JobMessage, JobProgress, JobStatus, Lane, NewDescriptor};

use crate::error::Result;

/// Filter for [`DescriptorStore::find`]. Results are always ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptorFilter {
	pub statuses: Vec<JobStatus>,
	pub lane: Option<Lane>,
	pub signature: Option<String>,
	/// Only descriptors whose `start_after` is null or not later than this.
	pub due_by: Option<DateTime<Utc>>,
	pub limit: Option<u32>,
}

impl DescriptorFilter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn status(mut self, status: JobStatus) -> Self {
		self.statuses.push(status);
		self
	}

	pub fn statuses(mut self, statuses: &[JobStatus]) -> Self {
		self.statuses.extend_from_slice(statuses);
		self
	}

	pub fn lane(mut self, lane: Lane) -> Self {
		self.lane = Some(lane);
		self
	}

	pub fn signature(mut self, signature: impl Into<String>) -> Self {
		self.signature = Some(signature.into());
		self
	}

	pub fn due_by(mut self, at: DateTime<Utc>) -> Self {
		self.due_by = Some(at);
		self
	}

	pub fn limit(mut self, limit: u32) -> Self {
		self.limit = Some(limit);
		self
	}
}

/// Result of an enqueue-style insert.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
	Created(JobDescriptor),
	/// An unstarted descriptor with the same signature already existed.
	Existing(JobDescriptor),
}

impl CreateOutcome {
	pub fn descriptor(&self) -> &JobDescriptor {
		match self {
			Self::Created(d) | Self::Existing(d) => d,
		}
	}

	pub fn was_created(&self) -> bool {
		matches!(self, Self::Created(_))
	}
}

/// Progress written back after every unit of work. Never carries a status.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
	pub total_steps: i64,
	pub steps_processed: i64,
	/// `None` keeps the previously saved state.
	pub saved_state: Option<serde_json::Value>,
	pub saved_messages: Vec<JobMessage>,
	pub scratch_ref: Option<String>,
	/// Lease holder writing this checkpoint; a lost lease rejects the write.
	pub lease_owner: Option<String>,
	pub lease_expiry: DateTime<Utc>,
}

impl Checkpoint {
	pub fn capture(
		progress: &JobProgress,
		saved_state: Option<serde_json::Value>,
		lease_owner: Option<&str>,
		lease_expiry: DateTime<Utc>,
	) -> Self {
		Self {
			total_steps: progress.total_steps,
			steps_processed: progress.current_step,
			saved_state,
			saved_messages: progress.messages().to_vec(),
			scratch_ref: progress.scratch_ref().map(str::to_string),
			lease_owner: lease_owner.map(str::to_string),
			lease_expiry,
		}
	}
}

#[async_trait]
pub trait DescriptorStore: Send + Sync {
	/// Insert unless an unstarted descriptor with the same signature exists.
	async fn create_unique(&self, new: &NewDescriptor) -> Result<CreateOutcome>;
	async fn get(&self, id: DescriptorId) -> Result<Option<JobDescriptor>>;
	async fn find(&self, filter: &DescriptorFilter) -> Result<Vec<JobDescriptor>>;
	async fn delete(&self, id: DescriptorId) -> Result<bool>;

	/// Atomically move `id` to `to` if its status is one of `from`.
	async fn transition(&self, id: DescriptorId, from: &[JobStatus], to: JobStatus) -> Result<bool>;
	async fn set_status(&self, id: DescriptorId, status: JobStatus) -> Result<bool>;

	/// Initializing → Running, stamping `started` or `restarted`.
	async fn mark_started(&self, id: DescriptorId, at: DateTime<Utc>) -> Result<bool>;
	/// Status Complete, `finished` stamped, lease cleared.
	async fn mark_finished(&self, id: DescriptorId, at: DateTime<Utc>) -> Result<bool>;
	async fn checkpoint(&self, id: DescriptorId, checkpoint: &Checkpoint) -> Result<bool>;

	/// Back to New with a delayed start, lease cleared.
	async fn record_failure(
		&self,
		id: DescriptorId,
		failed_attempts: u32,
		start_after: DateTime<Utc>,
	) -> Result<bool>;
	/// Stalled active descriptor → Waiting, `resume_count + 1`.
	async fn record_stall_restart(&self, id: DescriptorId) -> Result<bool>;
	/// `last_processed_count = steps_processed` for active descriptors of a lane.
	async fn snapshot_progress(&self, lane: Lane) -> Result<u64>;
	/// Operator resume: back to Waiting with `resume_count` reset.
	async fn reset_for_resume(&self, id: DescriptorId, from: &[JobStatus]) -> Result<bool>;

	/// {New, Waiting} → Initializing with a lease held by `owner`.
	async fn claim_lease(&self, id: DescriptorId, owner: &str, expiry: DateTime<Utc>) -> Result<bool>;
	/// Worker-side acceptance of a handed-off descriptor.
	async fn confirm_handoff(&self, id: DescriptorId, owner: &str, expiry: DateTime<Utc>) -> Result<bool>;
	/// Undo a handoff whose worker never started.
	async fn abandon_handoff(&self, id: DescriptorId, owner: &str, restore: JobStatus) -> Result<bool>;
	async fn release_lease(&self, id: DescriptorId, owner: &str) -> Result<bool>;
	/// Active descriptors whose lease lapsed go back to Waiting.
	async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<DescriptorId>>;
	/// Active descriptors under a lease: coordinator workers and in-process runs.
	async fn count_leased_active(&self) -> Result<u64>;

	/// Delete Complete/Cancelled descriptors last touched before `cutoff`.
	async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64>;
}
