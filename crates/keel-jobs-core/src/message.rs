// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity attached to a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
	Info,
	Notice,
	Warning,
	Error,
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Info => write!(f, "info"),
			Self::Notice => write!(f, "notice"),
			Self::Warning => write!(f, "warning"),
			Self::Error => write!(f, "error"),
		}
	}
}

impl FromStr for Severity {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"info" => Ok(Self::Info),
			"notice" => Ok(Self::Notice),
			"warning" => Ok(Self::Warning),
			"error" => Ok(Self::Error),
			_ => Err(format!("unknown severity: {s}")),
		}
	}
}

/// One entry of a job's append-only message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
	pub at: DateTime<Utc>,
	pub severity: Severity,
	pub text: String,
}

impl JobMessage {
	pub fn new(text: impl Into<String>, severity: Severity) -> Self {
		Self {
			at: Utc::now(),
			severity,
			text: text.into(),
		}
	}
}
