// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The service object callers hold instead of a global job manager.

use std::sync::Arc;

use chrono::{Duration, Utc};
use keel_jobs_core::{DescriptorId, Job, JobDescriptor, JobRegistry, JobStatus, Lane};
use serde::Serialize;

use crate::channels::{
	AmbientIdentity, DeferredDispatch, DispatchChannel, IdentityProvider, Notifier, TracingNotifier,
};
use crate::dispatcher::{EnqueueOptions, LaneDispatcher, NextJob};
use crate::error::{JobsError, Result};
use crate::health::{HealthMonitor, HealthReport};
use crate::resources::{ResourceProbe, SysinfoProbe};
use crate::runner::{Claim, JobRunner, RunOutcome};
use crate::settings::EngineSettings;
use crate::store::DescriptorStore;

const PURGE_BATCH: u32 = 500;

/// Result of running one lane once.
#[derive(Debug, Clone, PartialEq)]
pub enum LaneRun {
	Idle,
	Busy,
	Ran { id: DescriptorId, outcome: RunOutcome },
}

/// Everything one lane batch ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaneDrain {
	pub ran: Vec<(DescriptorId, RunOutcome)>,
	/// Immediate-lane jobs enqueued during the batch and run after it.
	pub flushed: Vec<(DescriptorId, RunOutcome)>,
}

/// Row of `list-pending` output.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PendingJob {
	pub id: DescriptorId,
	pub title: String,
	pub implementation: String,
	pub status: JobStatus,
	pub steps_processed: i64,
	pub total_steps: i64,
	pub start_after: Option<chrono::DateTime<Utc>>,
}

impl From<&JobDescriptor> for PendingJob {
	fn from(d: &JobDescriptor) -> Self {
		Self {
			id: d.id,
			title: d.title.clone(),
			implementation: d.implementation.clone(),
			status: d.status,
			steps_processed: d.steps_processed,
			total_steps: d.total_steps,
			start_after: d.start_after,
		}
	}
}

pub struct JobService {
	store: Arc<dyn DescriptorStore>,
	dispatch: Arc<dyn DispatchChannel>,
	dispatcher: LaneDispatcher,
	runner: JobRunner,
	health: HealthMonitor,
}

impl JobService {
	pub fn builder(store: Arc<dyn DescriptorStore>, registry: Arc<JobRegistry>) -> JobServiceBuilder {
		JobServiceBuilder {
			store,
			registry,
			settings: EngineSettings::default(),
			dispatch: None,
			notifier: None,
			identity: None,
			probe: None,
		}
	}

	pub fn store(&self) -> &Arc<dyn DescriptorStore> {
		&self.store
	}

	pub fn dispatcher(&self) -> &LaneDispatcher {
		&self.dispatcher
	}

	pub fn settings(&self) -> &EngineSettings {
		self.runner.settings()
	}

	pub async fn enqueue(&self, job: &dyn Job, options: EnqueueOptions) -> Result<DescriptorId> {
		self.dispatcher.enqueue(job, options).await
	}

	pub async fn get(&self, id: DescriptorId) -> Result<JobDescriptor> {
		self.store.get(id).await?.ok_or(JobsError::NotFound(id))
	}

	/// Claim and run the next eligible descriptor of a lane, if any.
	#[tracing::instrument(skip(self), fields(lane = %lane))]
	pub async fn run_lane_once(&self, lane: Lane) -> Result<LaneRun> {
		match self.dispatcher.next_pending_job(lane).await? {
			NextJob::Idle => Ok(LaneRun::Idle),
			NextJob::Busy => Ok(LaneRun::Busy),
			NextJob::Ready(descriptor) => {
				let outcome = self.runner.run_job(descriptor.id, Claim::Fresh).await?;
				Ok(LaneRun::Ran {
					id: descriptor.id,
					outcome,
				})
			}
		}
	}

	/// Run a lane until it is idle, busy or a job suspends, then flush the
	/// Immediate-lane jobs the batch enqueued.
	#[tracing::instrument(skip(self), fields(lane = %lane))]
	pub async fn drain_lane(&self, lane: Lane) -> Result<LaneDrain> {
		let mut drain = LaneDrain::default();
		while let LaneRun::Ran { id, outcome } = self.run_lane_once(lane).await? {
			let stop = matches!(outcome, RunOutcome::Suspended(_) | RunOutcome::ClaimConflict);
			drain.ran.push((id, outcome));
			if stop {
				break;
			}
		}
		drain.flushed = self.flush_immediate().await?;
		Ok(drain)
	}

	pub async fn run_job(&self, id: DescriptorId) -> Result<RunOutcome> {
		self.runner.run_job(id, Claim::Fresh).await
	}

	/// Worker-process entry: run a descriptor the coordinator leased to `owner`.
	pub async fn run_handoff(&self, id: DescriptorId, owner: &str) -> Result<RunOutcome> {
		self.runner
			.run_job(
				id,
				Claim::Handoff {
					owner: owner.to_string(),
				},
			)
			.await
	}

	pub async fn check_health(&self, lane: Lane) -> Result<HealthReport> {
		self.health.check_health(lane).await
	}

	pub async fn list_pending(&self, lane: Lane) -> Result<Vec<PendingJob>> {
		let pending = self.dispatcher.list_pending(lane).await?;
		Ok(pending.iter().map(PendingJob::from).collect())
	}

	/// Run Immediate-lane jobs enqueued during the caller's batch.
	#[tracing::instrument(skip(self))]
	pub async fn flush_immediate(&self) -> Result<Vec<(DescriptorId, RunOutcome)>> {
		let ids = self.dispatch.take_deferred().await;
		let mut outcomes = Vec::with_capacity(ids.len());
		for id in ids {
			let outcome = self.runner.run_job(id, Claim::Fresh).await?;
			outcomes.push((id, outcome));
		}
		Ok(outcomes)
	}

	/// Stop a job at its next checkpoint boundary.
	#[tracing::instrument(skip(self), fields(descriptor_id = %id))]
	pub async fn pause(&self, id: DescriptorId) -> Result<bool> {
		let paused = self
			.store
			.transition(
				id,
				&[
					JobStatus::New,
					JobStatus::Initializing,
					JobStatus::Running,
					JobStatus::Waiting,
				],
				JobStatus::Paused,
			)
			.await?;
		if paused {
			tracing::info!("job paused by operator");
		}
		Ok(paused)
	}

	/// Put a paused or broken job back in line with a fresh stall budget.
	#[tracing::instrument(skip(self), fields(descriptor_id = %id))]
	pub async fn resume(&self, id: DescriptorId) -> Result<bool> {
		let resumed = self
			.store
			.reset_for_resume(id, &[JobStatus::Paused, JobStatus::Broken])
			.await?;
		if resumed {
			tracing::info!("job resumed by operator");
		}
		Ok(resumed)
	}

	#[tracing::instrument(skip(self), fields(descriptor_id = %id))]
	pub async fn cancel(&self, id: DescriptorId) -> Result<bool> {
		let cancelled = self
			.store
			.transition(
				id,
				&[
					JobStatus::New,
					JobStatus::Initializing,
					JobStatus::Running,
					JobStatus::Waiting,
					JobStatus::Paused,
					JobStatus::Broken,
				],
				JobStatus::Cancelled,
			)
			.await?;
		if cancelled {
			tracing::info!("job cancelled by operator");
		}
		Ok(cancelled)
	}

	/// Delete a descriptor that is not currently being processed.
	#[tracing::instrument(skip(self), fields(descriptor_id = %id))]
	pub async fn delete(&self, id: DescriptorId) -> Result<bool> {
		let descriptor = self.get(id).await?;
		if descriptor.status.is_active() {
			tracing::warn!(status = %descriptor.status, "refusing to delete active job");
			return Ok(false);
		}
		self.store.delete(id).await
	}

	/// Delete Complete and Cancelled descriptors older than `retention`.
	#[tracing::instrument(skip(self))]
	pub async fn purge_finished(&self, retention: Duration) -> Result<u64> {
		let cutoff = Utc::now() - retention;
		let mut total = 0;
		loop {
			let deleted = self.store.purge_finished_before(cutoff, PURGE_BATCH).await?;
			total += deleted;
			if deleted < u64::from(PURGE_BATCH) {
				break;
			}
		}
		if total > 0 {
			tracing::info!(deleted = total, "purged finished jobs");
		}
		Ok(total)
	}
}

pub struct JobServiceBuilder {
	store: Arc<dyn DescriptorStore>,
	registry: Arc<JobRegistry>,
	settings: EngineSettings,
	dispatch: Option<Arc<dyn DispatchChannel>>,
	notifier: Option<Arc<dyn Notifier>>,
	identity: Option<Arc<dyn IdentityProvider>>,
	probe: Option<Arc<dyn ResourceProbe>>,
}

impl JobServiceBuilder {
	pub fn settings(mut self, settings: EngineSettings) -> Self {
		self.settings = settings;
		self
	}

	pub fn dispatch(mut self, dispatch: Arc<dyn DispatchChannel>) -> Self {
		self.dispatch = Some(dispatch);
		self
	}

	pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
		self.notifier = Some(notifier);
		self
	}

	pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
		self.identity = Some(identity);
		self
	}

	pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
		self.probe = Some(probe);
		self
	}

	pub fn build(self) -> JobService {
		let dispatch = self
			.dispatch
			.unwrap_or_else(|| Arc::new(DeferredDispatch::new()));
		let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
		let identity = self.identity.unwrap_or_else(|| Arc::new(AmbientIdentity));
		let probe = self.probe.unwrap_or_else(|| Arc::new(SysinfoProbe::new()));

		let health = HealthMonitor::new(
			self.store.clone(),
			notifier.clone(),
			self.settings.stall_threshold,
		);
		let runner = JobRunner::new(self.store.clone(), self.registry, self.settings)
			.with_notifier(notifier)
			.with_identity(identity)
			.with_probe(probe);

		JobService {
			dispatcher: LaneDispatcher::new(self.store.clone(), dispatch.clone()),
			store: self.store,
			dispatch,
			runner,
			health,
		}
	}
}
