// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use keel_jobs_core::{from_state, to_state, Job, JobError, JobProgress, Result, Severity};
use keel_server_jobs::DescriptorStore;
use serde::{Deserialize, Serialize};

pub const IMPLEMENTATION: &str = "descriptor-purge";

const DEFAULT_BATCH_SIZE: u32 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeState {
	pub retention_days: u32,
	pub batch_size: u32,
	/// Fixed on first setup so a resumed run keeps deleting against the same
	/// horizon.
	pub cutoff: Option<DateTime<Utc>>,
	pub deleted: u64,
}

impl Default for PurgeState {
	fn default() -> Self {
		Self {
			retention_days: 30,
			batch_size: DEFAULT_BATCH_SIZE,
			cutoff: None,
			deleted: 0,
		}
	}
}

/// Deletes Complete and Cancelled descriptors older than the retention
/// window, one batch per step.
pub struct DescriptorPurgeJob {
	store: Arc<dyn DescriptorStore>,
	state: PurgeState,
}

impl DescriptorPurgeJob {
	pub fn new(store: Arc<dyn DescriptorStore>, retention_days: u32) -> Self {
		Self {
			store,
			state: PurgeState {
				retention_days,
				..PurgeState::default()
			},
		}
	}

	pub fn with_batch_size(mut self, batch_size: u32) -> Self {
		self.state.batch_size = batch_size.max(1);
		self
	}

	/// Blank instance for the registry; state arrives through `set_state`.
	pub fn blank(store: Arc<dyn DescriptorStore>) -> Self {
		Self {
			store,
			state: PurgeState::default(),
		}
	}

	pub fn purge_state(&self) -> &PurgeState {
		&self.state
	}
}

#[async_trait]
impl Job for DescriptorPurgeJob {
	fn implementation(&self) -> &'static str {
		IMPLEMENTATION
	}

	fn title(&self) -> String {
		format!(
			"Purge finished jobs older than {} days",
			self.state.retention_days
		)
	}

	async fn setup(&mut self, _progress: &mut JobProgress) -> Result<()> {
		if self.state.cutoff.is_none() {
			self.state.cutoff =
				Some(Utc::now() - Duration::days(i64::from(self.state.retention_days)));
		}
		Ok(())
	}

	async fn process(&mut self, progress: &mut JobProgress) -> Result<()> {
		let cutoff = self
			.state
			.cutoff
			.ok_or_else(|| JobError::InvalidState("purge cutoff not set".to_string()))?;

		let deleted = self
			.store
			.purge_finished_before(cutoff, self.state.batch_size)
			.await
			.map_err(|e| JobError::failed(format!("purge batch failed: {e}")))?;
		self.state.deleted += deleted;
		progress.advance();

		if deleted < u64::from(self.state.batch_size) {
			tracing::info!(
				deleted = self.state.deleted,
				retention_days = self.state.retention_days,
				"Descriptor purge completed"
			);
			progress.add_message(
				format!("Removed {} finished job descriptors", self.state.deleted),
				Severity::Info,
			);
			progress.complete();
		}
		Ok(())
	}

	fn state(&self) -> Result<serde_json::Value> {
		to_state(&self.state)
	}

	fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
		self.state = from_state(state)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use keel_jobs_core::{JobStatus, Lane, NewDescriptor};
	use keel_server_jobs::{create_pool, migrate, SqliteDescriptorStore};

	async fn file_store(dir: &tempfile::TempDir) -> Arc<dyn DescriptorStore> {
		let url = format!("sqlite:{}", dir.path().join("keel.db").display());
		let pool = create_pool(&url).await.unwrap();
		migrate(&pool).await.unwrap();
		Arc::new(SqliteDescriptorStore::new(pool))
	}

	async fn finished(store: &Arc<dyn DescriptorStore>, n: usize, status: JobStatus) {
		for i in 0..n {
			let outcome = store
				.create_unique(&NewDescriptor {
					signature: format!("{status}-{i}"),
					implementation: "report".to_string(),
					title: format!("Report {i}"),
					lane: Lane::Standard,
					start_after: None,
					total_steps: 1,
					saved_state: serde_json::Value::Null,
					saved_messages: Vec::new(),
					run_as: None,
				})
				.await
				.unwrap();
			store
				.set_status(outcome.descriptor().id, status)
				.await
				.unwrap();
		}
	}

	#[tokio::test]
	async fn test_signature_stable_until_setup() {
		let dir = tempfile::tempdir().unwrap();
		let store = file_store(&dir).await;
		let a = DescriptorPurgeJob::new(store.clone(), 30);
		let b = DescriptorPurgeJob::new(store, 30);
		assert_eq!(a.signature().unwrap(), b.signature().unwrap());
	}

	#[tokio::test]
	async fn test_purges_in_batches() {
		let dir = tempfile::tempdir().unwrap();
		let store = file_store(&dir).await;
		finished(&store, 5, JobStatus::Complete).await;
		finished(&store, 2, JobStatus::Cancelled).await;
		finished(&store, 1, JobStatus::Paused).await;
		tokio::time::sleep(std::time::Duration::from_millis(5)).await;

		let mut job = DescriptorPurgeJob::new(store.clone(), 0).with_batch_size(3);
		let mut progress = JobProgress::new();
		job.setup(&mut progress).await.unwrap();

		let mut steps = 0;
		while !progress.is_finished() {
			job.process(&mut progress).await.unwrap();
			steps += 1;
		}

		assert_eq!(steps, 3);
		assert_eq!(job.purge_state().deleted, 7);
		assert_eq!(progress.messages().len(), 1);

		let remaining = store
			.find(&keel_server_jobs::DescriptorFilter::new())
			.await
			.unwrap();
		assert_eq!(remaining.len(), 1);
		assert_eq!(remaining[0].status, JobStatus::Paused);
	}

	#[tokio::test]
	async fn test_recent_descriptors_survive() {
		let dir = tempfile::tempdir().unwrap();
		let store = file_store(&dir).await;
		finished(&store, 2, JobStatus::Complete).await;

		let mut job = DescriptorPurgeJob::new(store.clone(), 30);
		let mut progress = JobProgress::new();
		job.setup(&mut progress).await.unwrap();
		job.process(&mut progress).await.unwrap();

		assert!(progress.is_finished());
		assert_eq!(job.purge_state().deleted, 0);
	}

	#[tokio::test]
	async fn test_cutoff_survives_state_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let store = file_store(&dir).await;
		let mut job = DescriptorPurgeJob::new(store.clone(), 7);
		job.setup(&mut JobProgress::new()).await.unwrap();
		let cutoff = job.purge_state().cutoff;

		let mut resumed = DescriptorPurgeJob::blank(store);
		resumed.set_state(job.state().unwrap()).unwrap();
		resumed.setup(&mut JobProgress::new()).await.unwrap();
		assert_eq!(resumed.purge_state().cutoff, cutoff);
		assert_eq!(resumed.purge_state().retention_days, 7);
	}
}
