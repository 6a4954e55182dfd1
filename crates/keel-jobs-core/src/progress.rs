// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::message::{JobMessage, Severity};

/// Progress counters and message log of a job instance.
///
/// The run loop owns one of these for the duration of a claim and writes it
/// back to the descriptor on every checkpoint. Jobs advance it from
/// [`crate::Job::process`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobProgress {
	pub total_steps: i64,
	pub current_step: i64,
	pub is_complete: bool,
	messages: Vec<JobMessage>,
	scratch_ref: Option<String>,
}

impl JobProgress {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn resume(
		total_steps: i64,
		current_step: i64,
		messages: Vec<JobMessage>,
		scratch_ref: Option<String>,
	) -> Self {
		Self {
			total_steps,
			current_step,
			is_complete: false,
			messages,
			scratch_ref,
		}
	}

	pub fn is_finished(&self) -> bool {
		self.is_complete
	}

	/// Record one finished step, completing the job once `total_steps` is reached.
	pub fn advance(&mut self) {
		self.current_step += 1;
		if self.total_steps > 0 && self.current_step >= self.total_steps {
			self.is_complete = true;
		}
	}

	pub fn complete(&mut self) {
		self.is_complete = true;
	}

	pub fn add_message(&mut self, text: impl Into<String>, severity: Severity) {
		self.messages.push(JobMessage::new(text, severity));
	}

	pub fn messages(&self) -> &[JobMessage] {
		&self.messages
	}

	/// Remember a scratch artifact to discard once the job completes.
	pub fn set_scratch_ref(&mut self, path: impl Into<String>) {
		self.scratch_ref = Some(path.into());
	}

	pub fn scratch_ref(&self) -> Option<&str> {
		self.scratch_ref.as_deref()
	}

	pub fn take_scratch_ref(&mut self) -> Option<String> {
		self.scratch_ref.take()
	}
}
