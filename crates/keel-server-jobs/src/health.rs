// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use keel_jobs_core::{DescriptorId, JobStatus, Lane};
use serde::Serialize;

use crate::channels::Notifier;
use crate::error::Result;
use crate::store::{DescriptorFilter, DescriptorStore};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
	Healthy,
	/// Stalled jobs were restarted.
	Degraded,
	/// Stalled jobs were paused and need an operator.
	Unhealthy,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
	pub lane: Lane,
	pub restarted: Vec<DescriptorId>,
	pub paused: Vec<DescriptorId>,
	/// Active descriptors whose progress snapshot was refreshed.
	pub observed: u64,
}

impl HealthReport {
	pub fn state(&self) -> HealthState {
		if !self.paused.is_empty() {
			HealthState::Unhealthy
		} else if !self.restarted.is_empty() {
			HealthState::Degraded
		} else {
			HealthState::Healthy
		}
	}
}

/// Periodic sweep that restarts or pauses jobs which stopped advancing.
///
/// A job is stalled when `steps_processed` has not moved since the previous
/// sweep's snapshot. Snapshots start at -1, so every job gets at least one
/// full sweep interval before it can be considered stalled.
#[derive(Clone)]
pub struct HealthMonitor {
	store: Arc<dyn DescriptorStore>,
	notifier: Arc<dyn Notifier>,
	stall_threshold: u32,
}

impl HealthMonitor {
	pub fn new(
		store: Arc<dyn DescriptorStore>,
		notifier: Arc<dyn Notifier>,
		stall_threshold: u32,
	) -> Self {
		Self {
			store,
			notifier,
			stall_threshold,
		}
	}

	#[tracing::instrument(skip(self), fields(lane = %lane))]
	pub async fn check_health(&self, lane: Lane) -> Result<HealthReport> {
		let mut report = HealthReport {
			lane,
			restarted: Vec::new(),
			paused: Vec::new(),
			observed: 0,
		};

		let active = self
			.store
			.find(&DescriptorFilter::new().lane(lane).statuses(JobStatus::ACTIVE))
			.await?;

		for descriptor in active
			.iter()
			.filter(|d| d.steps_processed == d.last_processed_count)
		{
			if descriptor.resume_count + 1 < self.stall_threshold {
				if self.store.record_stall_restart(descriptor.id).await? {
					tracing::warn!(
						descriptor_id = %descriptor.id,
						resume_count = descriptor.resume_count + 1,
						step = descriptor.steps_processed,
						"stalled job restarted"
					);
					report.restarted.push(descriptor.id);
				}
			} else if self
				.store
				.transition(descriptor.id, JobStatus::ACTIVE, JobStatus::Paused)
				.await?
			{
				tracing::error!(
					descriptor_id = %descriptor.id,
					resume_count = descriptor.resume_count,
					"stalled job paused"
				);
				self.notifier
					.notify(
						&format!("Job paused: {}", descriptor.title),
						&format!(
							"Job {} ({}) stopped at step {} of {} and was restarted {} times without progress.",
							descriptor.id,
							descriptor.implementation,
							descriptor.steps_processed,
							descriptor.total_steps,
							descriptor.resume_count
						),
					)
					.await;
				report.paused.push(descriptor.id);
			}
		}

		report.observed = self.store.snapshot_progress(lane).await?;
		tracing::debug!(
			restarted = report.restarted.len(),
			paused = report.paused.len(),
			observed = report.observed,
			"health sweep done"
		);
		Ok(report)
	}
}
