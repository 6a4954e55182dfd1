// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_jobs_core::{DescriptorId, Job, JobDescriptor, JobProgress, JobStatus, Lane, NewDescriptor};

use crate::channels::DispatchChannel;
use crate::error::Result;
use crate::store::{CreateOutcome, DescriptorFilter, DescriptorStore};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
	pub start_after: Option<DateTime<Utc>>,
	pub run_as: Option<String>,
	/// Overrides the lane the job asks for.
	pub lane: Option<Lane>,
}

impl EnqueueOptions {
	pub fn start_after(mut self, at: DateTime<Utc>) -> Self {
		self.start_after = Some(at);
		self
	}

	pub fn run_as(mut self, identity: impl Into<String>) -> Self {
		self.run_as = Some(identity.into());
		self
	}

	pub fn lane(mut self, lane: Lane) -> Self {
		self.lane = Some(lane);
		self
	}
}

/// Outcome of asking a lane for work.
#[derive(Debug, Clone, PartialEq)]
pub enum NextJob {
	Ready(JobDescriptor),
	/// Another descriptor in the lane is already being processed.
	Busy,
	Idle,
}

/// Enqueues jobs and selects the next descriptor to run in each lane.
#[derive(Clone)]
pub struct LaneDispatcher {
	store: Arc<dyn DescriptorStore>,
	dispatch: Arc<dyn DispatchChannel>,
}

impl LaneDispatcher {
	pub fn new(store: Arc<dyn DescriptorStore>, dispatch: Arc<dyn DispatchChannel>) -> Self {
		Self { store, dispatch }
	}

	/// Persist a job unless an unstarted one with the same signature exists.
	#[tracing::instrument(skip(self, job, options), fields(implementation = job.implementation()))]
	pub async fn enqueue(&self, job: &dyn Job, options: EnqueueOptions) -> Result<DescriptorId> {
		let signature = job.signature()?;
		let mut progress = JobProgress::new();
		let requested = job.job_type(&mut progress);
		let lane = options.lane.unwrap_or(requested);

		let new = NewDescriptor {
			signature,
			implementation: job.implementation().to_string(),
			title: job.title(),
			lane,
			start_after: options.start_after,
			total_steps: progress.total_steps,
			saved_state: job.state()?,
			saved_messages: progress.messages().to_vec(),
			run_as: options.run_as,
		};

		let descriptor = match self.store.create_unique(&new).await? {
			CreateOutcome::Existing(existing) => {
				tracing::debug!(descriptor_id = %existing.id, "job already queued");
				return Ok(existing.id);
			}
			CreateOutcome::Created(descriptor) => descriptor,
		};

		match descriptor.start_after {
			Some(at) if at > Utc::now() => self.dispatch.schedule_for(&descriptor, at).await,
			_ => self.dispatch.start_immediately(&descriptor).await,
		}

		tracing::info!(descriptor_id = %descriptor.id, lane = %lane, "job enqueued");
		Ok(descriptor.id)
	}

	/// Next descriptor a lane runner should claim.
	///
	/// A lane holds at most one active descriptor, so an occupied lane reports
	/// `Busy` even when Waiting work is queued behind it. Otherwise Waiting
	/// descriptors resume before anything new starts.
	#[tracing::instrument(skip(self), fields(lane = %lane))]
	pub async fn next_pending_job(&self, lane: Lane) -> Result<NextJob> {
		let active = self
			.store
			.find(&DescriptorFilter::new().lane(lane).statuses(JobStatus::ACTIVE).limit(1))
			.await?;
		if !active.is_empty() {
			return Ok(NextJob::Busy);
		}

		if let Some(waiting) = self.first(lane, &[JobStatus::Waiting], None).await? {
			return Ok(NextJob::Ready(waiting));
		}

		Ok(match self.first(lane, &[JobStatus::New], Some(Utc::now())).await? {
			Some(descriptor) => NextJob::Ready(descriptor),
			None => NextJob::Idle,
		})
	}

	/// Next claimable descriptor across all lanes, ignoring lane occupancy.
	pub async fn next_candidate(&self, now: DateTime<Utc>) -> Result<Option<JobDescriptor>> {
		for lane in Lane::ALL {
			if let Some(waiting) = self.first(lane, &[JobStatus::Waiting], None).await? {
				return Ok(Some(waiting));
			}
			if let Some(new) = self.first(lane, &[JobStatus::New], Some(now)).await? {
				return Ok(Some(new));
			}
		}
		Ok(None)
	}

	/// New and Waiting descriptors of a lane, oldest first.
	pub async fn list_pending(&self, lane: Lane) -> Result<Vec<JobDescriptor>> {
		self.store
			.find(&DescriptorFilter::new().lane(lane).statuses(JobStatus::CLAIMABLE))
			.await
	}

	async fn first(
		&self,
		lane: Lane,
		statuses: &[JobStatus],
		due_by: Option<DateTime<Utc>>,
	) -> Result<Option<JobDescriptor>> {
		let mut filter = DescriptorFilter::new().lane(lane).statuses(statuses).limit(1);
		filter.due_by = due_by;
		Ok(self.store.find(&filter).await?.into_iter().next())
	}
}
