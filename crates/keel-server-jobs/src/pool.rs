// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{
	SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{JobsError, Result};

/// Connection tunables for the descriptor database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
	pub max_connections: u32,
	pub busy_timeout: Duration,
	/// WAL with `synchronous = NORMAL`; otherwise a rollback journal with
	/// `synchronous = FULL`.
	pub wal: bool,
}

impl Default for PoolSettings {
	fn default() -> Self {
		Self {
			max_connections: 5,
			busy_timeout: Duration::from_secs(5),
			wal: true,
		}
	}
}

/// Create a SqlitePool with WAL mode and common settings.
///
/// # Arguments
/// * `database_url` - SQLite connection string (e.g., "sqlite:./keel.db")
///
/// # Errors
/// Returns `JobsError::Internal` if the URL is invalid, or `JobsError::Database`
/// if the connection fails.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
	create_pool_with(database_url, &PoolSettings::default()).await
}

#[tracing::instrument(skip(database_url), fields(max_connections = settings.max_connections, wal = settings.wal))]
pub async fn create_pool_with(database_url: &str, settings: &PoolSettings) -> Result<SqlitePool> {
	let (journal, synchronous) = if settings.wal {
		(SqliteJournalMode::Wal, SqliteSynchronous::Normal)
	} else {
		(SqliteJournalMode::Delete, SqliteSynchronous::Full)
	};
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| JobsError::Internal(format!("Invalid database URL: {e}")))?
		.journal_mode(journal)
		.synchronous(synchronous)
		.busy_timeout(settings.busy_timeout)
		.create_if_missing(true);

	let pool = SqlitePoolOptions::new()
		.max_connections(settings.max_connections)
		.connect_with(options)
		.await?;

	tracing::debug!("database pool created");
	Ok(pool)
}

const SCHEMA: &[&str] = &[
	r#"
	CREATE TABLE IF NOT EXISTS job_descriptors (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		signature TEXT NOT NULL,
		implementation TEXT NOT NULL,
		title TEXT NOT NULL DEFAULT '',
		lane TEXT NOT NULL,
		status TEXT NOT NULL,
		start_after TEXT,
		started TEXT,
		restarted TEXT,
		finished TEXT,
		total_steps INTEGER NOT NULL DEFAULT 0,
		steps_processed INTEGER NOT NULL DEFAULT 0,
		last_processed_count INTEGER NOT NULL DEFAULT -1,
		resume_count INTEGER NOT NULL DEFAULT 0,
		failed_attempts INTEGER NOT NULL DEFAULT 0,
		saved_state TEXT NOT NULL DEFAULT 'null',
		saved_messages TEXT NOT NULL DEFAULT '[]',
		run_as TEXT,
		lock_owner TEXT,
		lock_expiry TEXT,
		scratch_ref TEXT,
		created_at TEXT NOT NULL,
		updated_at TEXT NOT NULL
	)
	"#,
	"CREATE INDEX IF NOT EXISTS idx_job_descriptors_lane_status ON job_descriptors(lane, status, id)",
	"CREATE INDEX IF NOT EXISTS idx_job_descriptors_signature ON job_descriptors(signature, status)",
];

/// Create the descriptor table and its indexes. Safe to run on every start.
#[tracing::instrument(skip(pool))]
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
	for statement in SCHEMA {
		sqlx::query(statement).execute(pool).await?;
	}
	tracing::debug!("job descriptor schema ready");
	Ok(())
}
