// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Claim-and-run loop.
//!
//! A run claims one descriptor, rebuilds the job from the registry and calls
//! [`Job::process`] until the job finishes, fails, stalls, exhausts its
//! resource budget or is taken away by another actor. Progress is written
//! back after every step; the status column is only ever changed through
//! conditional updates.

use std::io::ErrorKind;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_jobs_core::{DescriptorId, Job, JobError, JobProgress, JobRegistry, JobStatus, Severity};
use uuid::Uuid;

use crate::channels::{AmbientIdentity, IdentityProvider, Notifier, TracingNotifier};
use crate::error::Result;
use crate::resources::{BudgetBreach, ResourceProbe, RunBudget, SysinfoProbe};
use crate::retry::{GiveUpReason, RetryDecision, RetryPolicy};
use crate::settings::EngineSettings;
use crate::store::{Checkpoint, DescriptorStore};

/// How a run gets hold of its descriptor.
///
/// Either way the run ends up holding the descriptor's lease under an owner
/// token; a run that finds a different owner on reload has been displaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
	/// Claim a New or Waiting descriptor directly under a new run token.
	Fresh,
	/// Accept a descriptor the coordinator already moved to Initializing
	/// under this lease owner.
	Handoff { owner: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
	/// Someone else holds the descriptor; nothing was done.
	ClaimConflict,
	Completed,
	/// Budget exceeded; the descriptor is Waiting and resumes later.
	Suspended(BudgetBreach),
	/// The status was changed by another actor (pause, cancel, health restart).
	Interrupted(JobStatus),
	/// A step raised an error; the retry decision has been applied.
	Failed(RetryDecision),
	/// Marked Broken without retry.
	Broken(String),
	/// The descriptor was deleted while running.
	Vanished,
}

impl RunOutcome {
	pub fn is_success(&self) -> bool {
		matches!(
			self,
			Self::Completed | Self::Suspended(_) | Self::Interrupted(_)
		)
	}
}

enum StepExit {
	Stalled(u32),
	Suspend(BudgetBreach),
}

pub struct JobRunner {
	store: Arc<dyn DescriptorStore>,
	registry: Arc<JobRegistry>,
	notifier: Arc<dyn Notifier>,
	identity: Arc<dyn IdentityProvider>,
	probe: Arc<dyn ResourceProbe>,
	settings: EngineSettings,
	retry: RetryPolicy,
}

impl JobRunner {
	pub fn new(
		store: Arc<dyn DescriptorStore>,
		registry: Arc<JobRegistry>,
		settings: EngineSettings,
	) -> Self {
		let retry = RetryPolicy::new(settings.max_retry_attempts, settings.retry_allow_list.clone());
		Self {
			store,
			registry,
			notifier: Arc::new(TracingNotifier),
			identity: Arc::new(AmbientIdentity),
			probe: Arc::new(SysinfoProbe::new()),
			settings,
			retry,
		}
	}

	pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
		self.notifier = notifier;
		self
	}

	pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
		self.identity = identity;
		self
	}

	pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
		self.probe = probe;
		self
	}

	pub fn settings(&self) -> &EngineSettings {
		&self.settings
	}

	fn lease_expiry(&self) -> DateTime<Utc> {
		Utc::now() + self.settings.lock_ttl_chrono()
	}

	#[tracing::instrument(skip(self, claim), fields(descriptor_id = %id, handoff = matches!(claim, Claim::Handoff { .. })))]
	pub async fn run_job(&self, id: DescriptorId, claim: Claim) -> Result<RunOutcome> {
		let (owner, claimed) = match claim {
			Claim::Fresh => {
				let owner = Uuid::new_v4().to_string();
				let claimed = self
					.store
					.claim_lease(id, &owner, self.lease_expiry())
					.await?;
				(owner, claimed)
			}
			Claim::Handoff { owner } => {
				let claimed = self
					.store
					.confirm_handoff(id, &owner, self.lease_expiry())
					.await?;
				(owner, claimed)
			}
		};
		if !claimed {
			tracing::info!("descriptor already claimed elsewhere");
			return Ok(RunOutcome::ClaimConflict);
		}

		let Some(descriptor) = self.store.get(id).await? else {
			tracing::error!("descriptor vanished right after claim");
			return Ok(RunOutcome::Vanished);
		};

		self.identity.assume(descriptor.run_as.as_deref());
		let result = self.execute(id, descriptor, &owner).await;
		self.identity.release();

		if let Err(e) = self.store.release_lease(id, &owner).await {
			tracing::warn!(error = %e, "failed to release run lease");
		}

		let outcome = result?;
		tracing::info!(outcome = ?outcome, "run finished");
		Ok(outcome)
	}

	async fn execute(
		&self,
		id: DescriptorId,
		descriptor: keel_jobs_core::JobDescriptor,
		owner: &str,
	) -> Result<RunOutcome> {
		let mut progress = descriptor.progress();
		let first_run = !descriptor.has_progress();

		let mut job = match self
			.registry
			.materialize(&descriptor.implementation, descriptor.saved_state.clone())
		{
			Ok(job) => job,
			Err(e) => {
				tracing::error!(
					implementation = %descriptor.implementation,
					error = %e,
					"cannot load job"
				);
				progress.add_message(format!("Cannot load job: {e}"), Severity::Error);
				self.checkpoint(id, &progress, None, owner).await?;
				if !self
					.store
					.transition(id, JobStatus::ACTIVE, JobStatus::Broken)
					.await?
				{
					return self.lost(id).await;
				}
				return Ok(RunOutcome::Broken(e.to_string()));
			}
		};

		let init = if first_run {
			job.setup(&mut progress).await
		} else {
			job.prepare_for_restart(&mut progress).await
		};
		if let Err(e) = init {
			let state = snapshot(job.as_ref());
			return self.fail(id, state, &mut progress, owner, e).await;
		}
		let state = snapshot(job.as_ref());
		if !self.checkpoint(id, &progress, state, owner).await? {
			return self.lost(id).await;
		}

		if progress.is_finished() {
			return self.finish(id, job.as_mut(), &mut progress, owner).await;
		}

		if !self.store.mark_started(id, Utc::now()).await? {
			return self.lost(id).await;
		}
		tracing::info!(
			title = %descriptor.title,
			step = progress.current_step,
			total = progress.total_steps,
			first_run,
			"job running"
		);

		let budget = RunBudget::start(self.settings.memory_limit_bytes, self.settings.time_limit);
		let mut idle_steps = 0u32;

		while !progress.is_finished() {
			let Some(current) = self.store.get(id).await? else {
				tracing::error!("descriptor vanished mid-run");
				return Ok(RunOutcome::Vanished);
			};
			if current.status != JobStatus::Running {
				tracing::info!(status = %current.status, "run interrupted");
				return Ok(RunOutcome::Interrupted(current.status));
			}
			if current.lock_owner.as_deref() != Some(owner) {
				tracing::warn!("run lease taken over");
				return Ok(RunOutcome::Interrupted(current.status));
			}

			let before = progress.current_step;
			if let Err(e) = job.process(&mut progress).await {
				let state = snapshot(job.as_ref());
				return self.fail(id, state, &mut progress, owner, e).await;
			}

			let mut exit = None;
			if progress.current_step == before && !progress.is_finished() {
				idle_steps += 1;
				if idle_steps > self.settings.stall_threshold {
					exit = Some(StepExit::Stalled(idle_steps));
				}
			} else {
				idle_steps = 0;
			}
			if exit.is_none() && !progress.is_finished() {
				exit = budget.check(self.probe.as_ref()).map(StepExit::Suspend);
			}

			match &exit {
				Some(StepExit::Stalled(steps)) => progress.add_message(
					format!("No progress after {steps} consecutive steps"),
					Severity::Error,
				),
				Some(StepExit::Suspend(breach)) => progress.add_message(
					format!("Suspended at step {}: {breach}", progress.current_step),
					Severity::Notice,
				),
				None => {}
			}

			let state = snapshot(job.as_ref());
			if !self.checkpoint(id, &progress, state, owner).await? {
				return self.lost(id).await;
			}

			match exit {
				Some(StepExit::Stalled(steps)) => {
					if !self
						.store
						.transition(id, &[JobStatus::Running], JobStatus::Broken)
						.await?
					{
						return self.lost(id).await;
					}
					tracing::error!(steps, "job made no progress, marked broken");
					self.notifier
						.notify(
							&format!("Job broken: {}", descriptor.title),
							&format!(
								"Job {id} ({}) made no progress in {steps} consecutive steps.",
								descriptor.implementation
							),
						)
						.await;
					return Ok(RunOutcome::Broken(format!(
						"no progress after {steps} consecutive steps"
					)));
				}
				Some(StepExit::Suspend(breach)) => {
					if !self
						.store
						.transition(id, &[JobStatus::Running], JobStatus::Waiting)
						.await?
					{
						return self.lost(id).await;
					}
					tracing::info!(%breach, step = progress.current_step, "job suspended");
					return Ok(RunOutcome::Suspended(breach));
				}
				None => {}
			}
		}

		self.finish(id, job.as_mut(), &mut progress, owner).await
	}

	async fn finish(
		&self,
		id: DescriptorId,
		job: &mut dyn Job,
		progress: &mut JobProgress,
		owner: &str,
	) -> Result<RunOutcome> {
		if let Err(e) = job.after_complete(progress).await {
			tracing::warn!(error = %e, "after_complete hook failed");
			progress.add_message(format!("Completion hook failed: {e}"), Severity::Warning);
		}
		if let Some(path) = progress.take_scratch_ref() {
			remove_scratch(&path).await;
		}
		let state = snapshot(&*job);
		if !self.checkpoint(id, progress, state, owner).await? {
			return self.lost(id).await;
		}
		if !self.store.mark_finished(id, Utc::now()).await? {
			return self.lost(id).await;
		}
		tracing::info!(steps = progress.current_step, "job complete");
		Ok(RunOutcome::Completed)
	}

	async fn fail(
		&self,
		id: DescriptorId,
		state: Option<serde_json::Value>,
		progress: &mut JobProgress,
		owner: &str,
		error: JobError,
	) -> Result<RunOutcome> {
		tracing::warn!(error = %error, step = progress.current_step, "job step failed");
		progress.add_message(error.to_string(), Severity::Error);

		if !self.checkpoint(id, progress, state, owner).await? {
			return self.lost(id).await;
		}
		if !self
			.store
			.transition(id, JobStatus::ACTIVE, JobStatus::Broken)
			.await?
		{
			return self.lost(id).await;
		}
		let Some(descriptor) = self.store.get(id).await? else {
			tracing::error!("descriptor vanished while recording failure");
			return Ok(RunOutcome::Vanished);
		};

		let decision = self.retry.decide(&descriptor, Utc::now());
		match decision {
			RetryDecision::Requeue {
				failed_attempts,
				start_after,
			} => {
				self.store
					.record_failure(id, failed_attempts, start_after)
					.await?;
				tracing::info!(failed_attempts, %start_after, "job requeued after failure");
			}
			RetryDecision::GiveUp(reason) => {
				let why = match reason {
					GiveUpReason::NotRetryable => "it is not eligible for retry".to_string(),
					GiveUpReason::AttemptsExhausted { max_attempts } => {
						format!("it failed after {max_attempts} retries")
					}
				};
				tracing::error!(reason = ?reason, "job left broken");
				self.notifier
					.notify(
						&format!("Job failed: {}", descriptor.title),
						&format!(
							"Job {id} ({}) is broken because {why}. Last error: {error}",
							descriptor.implementation
						),
					)
					.await;
			}
		}
		Ok(RunOutcome::Failed(decision))
	}

	/// The descriptor changed under us; report what it became.
	async fn lost(&self, id: DescriptorId) -> Result<RunOutcome> {
		match self.store.get(id).await? {
			Some(descriptor) => {
				tracing::info!(status = %descriptor.status, "descriptor changed by another actor");
				Ok(RunOutcome::Interrupted(descriptor.status))
			}
			None => {
				tracing::error!("descriptor vanished mid-run");
				Ok(RunOutcome::Vanished)
			}
		}
	}

	async fn checkpoint(
		&self,
		id: DescriptorId,
		progress: &JobProgress,
		saved_state: Option<serde_json::Value>,
		owner: &str,
	) -> Result<bool> {
		let checkpoint = Checkpoint::capture(progress, saved_state, Some(owner), self.lease_expiry());
		self.store.checkpoint(id, &checkpoint).await
	}
}

/// Current job state, or `None` to keep the previous checkpoint.
fn snapshot(job: &dyn Job) -> Option<serde_json::Value> {
	match job.state() {
		Ok(state) => Some(state),
		Err(e) => {
			tracing::warn!(error = %e, "job state not serializable, keeping previous checkpoint");
			None
		}
	}
}

async fn remove_scratch(path: &str) {
	let result = match tokio::fs::metadata(path).await {
		Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
		Ok(_) => tokio::fs::remove_file(path).await,
		Err(e) => Err(e),
	};
	match result {
		Ok(()) => tracing::debug!(path, "scratch artifact removed"),
		Err(e) if e.kind() == ErrorKind::NotFound => {}
		Err(e) => tracing::warn!(path, error = %e, "failed to remove scratch artifact"),
	}
}
