// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keel_jobs_core::{
	compute_signature, from_state, to_state, Job, JobError, JobProgress, JobRegistry, Lane,
	NewDescriptor, Result as JobResult,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::channels::Notifier;
use crate::pool::migrate;
use crate::resources::{ResourceProbe, SystemLoad};
use crate::sqlite::SqliteDescriptorStore;

/// A single shared connection, so every query sees the same in-memory database.
pub async fn create_test_pool() -> SqlitePool {
	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect("sqlite::memory:")
		.await
		.unwrap();
	migrate(&pool).await.unwrap();
	pool
}

pub async fn test_store() -> Arc<SqliteDescriptorStore> {
	Arc::new(SqliteDescriptorStore::new(create_test_pool().await))
}

pub fn new_descriptor(implementation: &str, lane: Lane, state: serde_json::Value) -> NewDescriptor {
	NewDescriptor {
		signature: compute_signature(implementation, &state).unwrap(),
		implementation: implementation.to_string(),
		title: format!("Test {implementation}"),
		lane,
		start_after: None,
		total_steps: 0,
		saved_state: state,
		saved_messages: Vec::new(),
		run_as: None,
	}
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepState {
	pub label: String,
	pub total: i64,
	pub lane: Option<Lane>,
	/// `current_step` seen by each `process` call.
	pub calls: Vec<i64>,
	pub setups: u32,
	pub restarts: u32,
	pub completed: bool,
}

/// Advances one step per call until `total` is reached.
#[derive(Debug, Default)]
pub struct StepJob {
	pub state: StepState,
}

impl StepJob {
	pub fn new(label: &str, total: i64) -> Self {
		Self {
			state: StepState {
				label: label.to_string(),
				total,
				..StepState::default()
			},
		}
	}

	pub fn in_lane(mut self, lane: Lane) -> Self {
		self.state.lane = Some(lane);
		self
	}
}

#[async_trait]
impl Job for StepJob {
	fn implementation(&self) -> &'static str {
		"step"
	}

	fn title(&self) -> String {
		format!("Step {}", self.state.label)
	}

	fn job_type(&self, progress: &mut JobProgress) -> Lane {
		progress.total_steps = self.state.total;
		self.state.lane.unwrap_or(Lane::Standard)
	}

	async fn setup(&mut self, _progress: &mut JobProgress) -> JobResult<()> {
		self.state.setups += 1;
		Ok(())
	}

	async fn prepare_for_restart(&mut self, _progress: &mut JobProgress) -> JobResult<()> {
		self.state.restarts += 1;
		Ok(())
	}

	async fn process(&mut self, progress: &mut JobProgress) -> JobResult<()> {
		self.state.calls.push(progress.current_step);
		progress.advance();
		Ok(())
	}

	async fn after_complete(&mut self, _progress: &mut JobProgress) -> JobResult<()> {
		self.state.completed = true;
		Ok(())
	}

	fn state(&self) -> JobResult<serde_json::Value> {
		to_state(&self.state)
	}

	fn set_state(&mut self, state: serde_json::Value) -> JobResult<()> {
		self.state = from_state(state)?;
		Ok(())
	}
}

/// Fails on every `process` call.
#[derive(Debug, Default)]
pub struct FailingJob {
	pub label: String,
}

#[async_trait]
impl Job for FailingJob {
	fn implementation(&self) -> &'static str {
		"failing"
	}

	fn title(&self) -> String {
		format!("Failing {}", self.label)
	}

	async fn process(&mut self, _progress: &mut JobProgress) -> JobResult<()> {
		Err(JobError::failed("remote endpoint refused the upload"))
	}

	fn state(&self) -> JobResult<serde_json::Value> {
		Ok(serde_json::json!({ "label": self.label }))
	}

	fn set_state(&mut self, state: serde_json::Value) -> JobResult<()> {
		self.label = state["label"].as_str().unwrap_or_default().to_string();
		Ok(())
	}
}

/// Never advances and never completes.
#[derive(Debug, Default)]
pub struct StallingJob {
	pub label: String,
}

#[async_trait]
impl Job for StallingJob {
	fn implementation(&self) -> &'static str {
		"stalling"
	}

	fn title(&self) -> String {
		format!("Stalling {}", self.label)
	}

	async fn process(&mut self, _progress: &mut JobProgress) -> JobResult<()> {
		Ok(())
	}

	fn state(&self) -> JobResult<serde_json::Value> {
		Ok(serde_json::json!({ "label": self.label }))
	}

	fn set_state(&mut self, state: serde_json::Value) -> JobResult<()> {
		self.label = state["label"].as_str().unwrap_or_default().to_string();
		Ok(())
	}
}

pub fn test_registry() -> JobRegistry {
	JobRegistry::new()
		.with("step", || Box::new(StepJob::default()))
		.with("failing", || Box::new(FailingJob::default()))
		.with("stalling", || Box::new(StallingJob::default()))
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
	pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
	pub fn subjects(&self) -> Vec<String> {
		self.sent
			.lock()
			.unwrap()
			.iter()
			.map(|(subject, _)| subject.clone())
			.collect()
	}
}

#[async_trait]
impl Notifier for RecordingNotifier {
	async fn notify(&self, subject: &str, body: &str) {
		self.sent
			.lock()
			.unwrap()
			.push((subject.to_string(), body.to_string()));
	}
}

/// Probe with values set by the test.
#[derive(Debug, Default)]
pub struct FixedProbe {
	memory_bytes: AtomicU64,
	load: Mutex<SystemLoad>,
}

impl FixedProbe {
	pub fn set_memory(&self, bytes: u64) {
		self.memory_bytes.store(bytes, Ordering::SeqCst);
	}

	pub fn set_load(&self, load: SystemLoad) {
		*self.load.lock().unwrap() = load;
	}
}

impl ResourceProbe for FixedProbe {
	fn process_memory_bytes(&self) -> Option<u64> {
		Some(self.memory_bytes.load(Ordering::SeqCst))
	}

	fn system_load(&self) -> SystemLoad {
		*self.load.lock().unwrap()
	}
}
