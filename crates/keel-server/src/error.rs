// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use keel_server_config::ConfigError;
use keel_server_jobs::JobsError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Jobs(#[from] JobsError),

	#[error("cannot resolve worker command: {0}")]
	WorkerCommand(#[source] std::io::Error),
}
