// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Collaborators the engine talks to but does not own: dispatch,
//! operator notification and run-as identity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_jobs_core::{DescriptorId, JobDescriptor, Lane};
use tokio::sync::Mutex;

/// Where newly enqueued descriptors are announced.
#[async_trait]
pub trait DispatchChannel: Send + Sync {
	async fn start_immediately(&self, descriptor: &JobDescriptor);

	async fn schedule_for(&self, descriptor: &JobDescriptor, at: DateTime<Utc>);

	/// Descriptors waiting for the post-batch flush, oldest first.
	async fn take_deferred(&self) -> Vec<DescriptorId> {
		Vec::new()
	}
}

/// Collects Immediate-lane descriptors until the caller's batch ends.
///
/// Other lanes need no announcement: their lane runner polls the store.
#[derive(Debug, Default)]
pub struct DeferredDispatch {
	pending: Mutex<Vec<DescriptorId>>,
}

impl DeferredDispatch {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl DispatchChannel for DeferredDispatch {
	async fn start_immediately(&self, descriptor: &JobDescriptor) {
		if descriptor.lane == Lane::Immediate {
			self.pending.lock().await.push(descriptor.id);
			tracing::debug!(descriptor_id = %descriptor.id, "deferred until post-batch flush");
		} else {
			tracing::debug!(
				descriptor_id = %descriptor.id,
				lane = %descriptor.lane,
				"left for lane runner"
			);
		}
	}

	async fn schedule_for(&self, descriptor: &JobDescriptor, at: DateTime<Utc>) {
		tracing::debug!(
			descriptor_id = %descriptor.id,
			lane = %descriptor.lane,
			start_after = %at,
			"scheduled"
		);
	}

	async fn take_deferred(&self) -> Vec<DescriptorId> {
		std::mem::take(&mut *self.pending.lock().await)
	}
}

/// Operator notification, used when a job is paused or given up on.
#[async_trait]
pub trait Notifier: Send + Sync {
	async fn notify(&self, subject: &str, body: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
	async fn notify(&self, subject: &str, body: &str) {
		tracing::warn!(subject, body, "operator notification");
	}
}

/// Switches the acting identity for the duration of a run.
pub trait IdentityProvider: Send + Sync {
	fn assume(&self, run_as: Option<&str>);

	fn release(&self);
}

/// Runs every job as the process's own identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmbientIdentity;

impl IdentityProvider for AmbientIdentity {
	fn assume(&self, run_as: Option<&str>) {
		if let Some(run_as) = run_as {
			tracing::debug!(run_as, "running with ambient identity");
		}
	}

	fn release(&self) {}
}

#[cfg(test)]
mod tests {
	use super::*;
	use keel_jobs_core::JobStatus;

	fn descriptor(id: i64, lane: Lane) -> JobDescriptor {
		let now = Utc::now();
		JobDescriptor {
			id: DescriptorId(id),
			signature: format!("sig-{id}"),
			implementation: "test".to_string(),
			title: "Test".to_string(),
			lane,
			status: JobStatus::New,
			start_after: None,
			started: None,
			restarted: None,
			finished: None,
			total_steps: 0,
			steps_processed: 0,
			last_processed_count: -1,
			resume_count: 0,
			failed_attempts: 0,
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

	#[tokio::test]
	async fn test_deferred_dispatch_keeps_only_immediate_lane() {
		let dispatch = DeferredDispatch::new();
		dispatch.start_immediately(&descriptor(1, Lane::Immediate)).await;
		dispatch.start_immediately(&descriptor(2, Lane::Standard)).await;
		dispatch.start_immediately(&descriptor(3, Lane::Immediate)).await;
		dispatch
			.schedule_for(&descriptor(4, Lane::Immediate), Utc::now())
			.await;

		assert_eq!(
			dispatch.take_deferred().await,
			vec![DescriptorId(1), DescriptorId(3)]
		);
		assert!(dispatch.take_deferred().await.is_empty());
	}
}
