// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use keel_jobs_core::{DescriptorId, JobError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobsError>;

#[derive(Debug, Error)]
pub enum JobsError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("descriptor not found: {0}")]
	NotFound(DescriptorId),

	#[error("job error: {0}")]
	Job(#[from] JobError),

	#[error("failed to spawn worker for descriptor {id}: {source}")]
	Spawn {
		id: DescriptorId,
		#[source]
		source: std::io::Error,
	},

	#[error("internal error: {0}")]
	Internal(String),
}
