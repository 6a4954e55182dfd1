// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashMap;
use std::fmt;

use crate::error::{JobError, Result};
use crate::job::Job;

type JobFactory = Box<dyn Fn() -> Box<dyn Job> + Send + Sync>;

/// Maps implementation names to factories producing blank job instances.
///
/// A descriptor only stores the implementation name and an opaque state
/// blob; the registry is how the run loop turns that back into a live job.
#[derive(Default)]
pub struct JobRegistry {
	factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register<F>(&mut self, implementation: &str, factory: F)
	where
		F: Fn() -> Box<dyn Job> + Send + Sync + 'static,
	{
		if self
			.factories
			.insert(implementation.to_string(), Box::new(factory))
			.is_some()
		{
			tracing::warn!(implementation, "job implementation registered twice");
		}
	}

	pub fn with<F>(mut self, implementation: &str, factory: F) -> Self
	where
		F: Fn() -> Box<dyn Job> + Send + Sync + 'static,
	{
		self.register(implementation, factory);
		self
	}

	pub fn contains(&self, implementation: &str) -> bool {
		self.factories.contains_key(implementation)
	}

	pub fn implementations(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}

	pub fn create(&self, implementation: &str) -> Result<Box<dyn Job>> {
		let factory = self
			.factories
			.get(implementation)
			.ok_or_else(|| JobError::UnknownImplementation(implementation.to_string()))?;
		Ok(factory())
	}

	/// Build a job and load checkpointed state into it.
	pub fn materialize(&self, implementation: &str, state: serde_json::Value) -> Result<Box<dyn Job>> {
		let mut job = self.create(implementation)?;
		job.set_state(state)?;
		Ok(job)
	}
}

impl fmt::Debug for JobRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("JobRegistry")
			.field("implementations", &self.implementations())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::progress::JobProgress;
	use async_trait::async_trait;

	struct EchoJob {
		label: String,
	}

	#[async_trait]
	impl Job for EchoJob {
		fn implementation(&self) -> &'static str {
			"echo"
		}

		fn title(&self) -> String {
			format!("Echo {}", self.label)
		}

		async fn process(&mut self, progress: &mut JobProgress) -> Result<()> {
			progress.complete();
			Ok(())
		}

		fn state(&self) -> Result<serde_json::Value> {
			Ok(serde_json::json!({ "label": self.label }))
		}

		fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
			self.label = state["label"]
				.as_str()
				.ok_or_else(|| JobError::InvalidState("missing label".to_string()))?
				.to_string();
			Ok(())
		}
	}

	fn registry() -> JobRegistry {
		JobRegistry::new().with("echo", || {
			Box::new(EchoJob {
				label: String::new(),
			})
		})
	}

	#[test]
	fn test_materialize_loads_state() {
		let job = registry()
			.materialize("echo", serde_json::json!({ "label": "hello" }))
			.unwrap();
		assert_eq!(job.title(), "Echo hello");
	}

	#[test]
	fn test_unknown_implementation() {
		let result = registry().create("missing");
		assert!(matches!(result, Err(JobError::UnknownImplementation(name)) if name == "missing"));
	}

	#[test]
	fn test_invalid_state_is_rejected() {
		let result = registry().materialize("echo", serde_json::json!({ "other": 1 }));
		assert!(matches!(result, Err(JobError::InvalidState(_))));
	}

	#[test]
	fn test_implementations_sorted() {
		let registry = registry().with("alpha", || {
			Box::new(EchoJob {
				label: String::new(),
			})
		});
		assert_eq!(registry.implementations(), vec!["alpha", "echo"]);
		assert!(registry.contains("echo"));
		assert!(!registry.contains("beta"));
	}
}
