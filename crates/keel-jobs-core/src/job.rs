// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The job contract every payload implements.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::descriptor::Lane;
use crate::error::Result;
use crate::progress::JobProgress;

/// A resumable unit of work.
///
/// The run loop calls [`Job::process`] repeatedly, checkpointing
/// [`Job::state`] and the [`JobProgress`] between calls. After a crash the job
/// is rebuilt from its registry factory, handed the last checkpointed state
/// through [`Job::set_state`] and re-entered at the last recorded step, so
/// `process` must tolerate running the same step twice.
#[async_trait]
pub trait Job: Send {
	/// Registry name used to rebuild this job type.
	fn implementation(&self) -> &'static str;

	fn title(&self) -> String;

	/// Lane this job runs in. May also set `progress.total_steps`.
	fn job_type(&self, _progress: &mut JobProgress) -> Lane {
		Lane::Standard
	}

	/// De-duplication fingerprint; override to force uniqueness per call.
	fn signature(&self) -> Result<String> {
		compute_signature(self.implementation(), &self.state()?)
	}

	/// Called once, before the first step.
	async fn setup(&mut self, _progress: &mut JobProgress) -> Result<()> {
		Ok(())
	}

	/// Called instead of `setup` on every later pickup.
	async fn prepare_for_restart(&mut self, _progress: &mut JobProgress) -> Result<()> {
		Ok(())
	}

	/// Do one bounded increment of work: advance `current_step` or complete.
	async fn process(&mut self, progress: &mut JobProgress) -> Result<()>;

	/// Release external resources after the final step.
	async fn after_complete(&mut self, _progress: &mut JobProgress) -> Result<()> {
		Ok(())
	}

	fn state(&self) -> Result<serde_json::Value>;

	fn set_state(&mut self, state: serde_json::Value) -> Result<()>;
}

/// SHA-256 over the implementation name and the canonical JSON state.
///
/// `serde_json::Value` keeps object keys sorted, so equal states always
/// serialize to the same bytes.
pub fn compute_signature(implementation: &str, state: &serde_json::Value) -> Result<String> {
	let mut hasher = Sha256::new();
	hasher.update(implementation.as_bytes());
	hasher.update(b"\n");
	hasher.update(serde_json::to_vec(state)?);
	Ok(hex::encode(hasher.finalize()))
}

pub fn to_state<T: Serialize>(value: &T) -> Result<serde_json::Value> {
	Ok(serde_json::to_value(value)?)
}

pub fn from_state<T: DeserializeOwned>(state: serde_json::Value) -> Result<T> {
	Ok(serde_json::from_value(state)?)
}
