// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types raised by job payloads.

use thiserror::Error;

/// Result type for job operations.
pub type Result<T> = std::result::Result<T, JobError>;

/// Errors a job can report back to the run loop.
#[derive(Debug, Error)]
pub enum JobError {
	#[error("job failed: {0}")]
	Failed(String),

	#[error("invalid job state: {0}")]
	InvalidState(String),

	#[error("unknown job implementation: {0}")]
	UnknownImplementation(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl JobError {
	pub fn failed(message: impl Into<String>) -> Self {
		Self::Failed(message.into())
	}
}
