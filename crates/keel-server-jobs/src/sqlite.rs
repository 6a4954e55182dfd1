// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite implementation of [`DescriptorStore`].

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use keel_jobs_core::{DescriptorId, JobDescriptor, JobStatus, Lane, NewDescriptor};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::{JobsError, Result};
use crate::store::{Checkpoint, CreateOutcome, DescriptorFilter, DescriptorStore};

const COLUMNS: &str = "id, signature, implementation, title, lane, status, start_after, \
	started, restarted, finished, total_steps, steps_processed, last_processed_count, \
	resume_count, failed_attempts, saved_state, saved_messages, run_as, lock_owner, \
	lock_expiry, scratch_ref, created_at, updated_at";

/// Timestamps are stored as fixed-width RFC3339 so text comparison orders them.
fn ts(at: DateTime<Utc>) -> String {
	at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(value)
		.map(|d| d.with_timezone(&Utc))
		.map_err(|e| JobsError::Internal(format!("Invalid timestamp {value:?}: {e}")))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
	value.as_deref().map(parse_ts).transpose()
}

#[derive(Clone)]
pub struct SqliteDescriptorStore {
	pool: SqlitePool,
}

impl SqliteDescriptorStore {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	async fn fetch_unstarted(&self, signature: &str) -> Result<Option<JobDescriptor>> {
		let row = sqlx::query_as::<_, DescriptorRow>(&format!(
			"SELECT {COLUMNS} FROM job_descriptors \
			 WHERE signature = ? AND status IN ('new', 'initializing') ORDER BY id LIMIT 1"
		))
		.bind(signature)
		.fetch_optional(&self.pool)
		.await?;
		row.map(JobDescriptor::try_from).transpose()
	}
}

#[async_trait]
impl DescriptorStore for SqliteDescriptorStore {
	#[tracing::instrument(skip(self, new), fields(implementation = %new.implementation, lane = %new.lane))]
	async fn create_unique(&self, new: &NewDescriptor) -> Result<CreateOutcome> {
		let now = ts(Utc::now());
		let saved_state = serde_json::to_string(&new.saved_state)?;
		let saved_messages = serde_json::to_string(&new.saved_messages)?;

		// A concurrent runner may move the existing unstarted row to Running
		// between the insert and the lookup; retry once more in that case.
		for _ in 0..3 {
			let inserted: Option<i64> = sqlx::query_scalar(
				r#"
				INSERT INTO job_descriptors (
					signature, implementation, title, lane, status, start_after,
					total_steps, saved_state, saved_messages, run_as, created_at, updated_at
				)
				SELECT ?, ?, ?, ?, 'new', ?, ?, ?, ?, ?, ?, ?
				WHERE NOT EXISTS (
					SELECT 1 FROM job_descriptors
					WHERE signature = ? AND status IN ('new', 'initializing')
				)
				RETURNING id
				"#,
			)
			.bind(&new.signature)
			.bind(&new.implementation)
			.bind(&new.title)
			.bind(new.lane.as_str())
			.bind(new.start_after.map(ts))
			.bind(new.total_steps)
			.bind(&saved_state)
			.bind(&saved_messages)
			.bind(&new.run_as)
			.bind(&now)
			.bind(&now)
			.bind(&new.signature)
			.fetch_optional(&self.pool)
			.await?;

			if let Some(id) = inserted {
				let id = DescriptorId(id);
				let descriptor = self.get(id).await?.ok_or(JobsError::NotFound(id))?;
				tracing::debug!(descriptor_id = %id, "descriptor created");
				return Ok(CreateOutcome::Created(descriptor));
			}

			if let Some(existing) = self.fetch_unstarted(&new.signature).await? {
				tracing::debug!(descriptor_id = %existing.id, "unstarted duplicate found");
				return Ok(CreateOutcome::Existing(existing));
			}
		}

		Err(JobsError::Internal(format!(
			"could not enqueue signature {} after repeated conflicts",
			new.signature
		)))
	}

	#[tracing::instrument(skip(self), fields(descriptor_id = %id))]
	async fn get(&self, id: DescriptorId) -> Result<Option<JobDescriptor>> {
		let row = sqlx::query_as::<_, DescriptorRow>(&format!(
			"SELECT {COLUMNS} FROM job_descriptors WHERE id = ?"
		))
		.bind(id.0)
		.fetch_optional(&self.pool)
		.await?;
		row.map(JobDescriptor::try_from).transpose()
	}

	#[tracing::instrument(skip(self, filter))]
	async fn find(&self, filter: &DescriptorFilter) -> Result<Vec<JobDescriptor>> {
		let mut qb: QueryBuilder<Sqlite> =
			QueryBuilder::new(format!("SELECT {COLUMNS} FROM job_descriptors WHERE 1 = 1"));

		if !filter.statuses.is_empty() {
			qb.push(" AND status IN (");
			let mut separated = qb.separated(", ");
			for status in &filter.statuses {
				separated.push_bind(status.as_str());
			}
			separated.push_unseparated(")");
		}
		if let Some(lane) = filter.lane {
			qb.push(" AND lane = ").push_bind(lane.as_str());
		}
		if let Some(signature) = &filter.signature {
			qb.push(" AND signature = ").push_bind(signature.clone());
		}
		if let Some(due_by) = filter.due_by {
			qb.push(" AND (start_after IS NULL OR start_after <= ")
				.push_bind(ts(due_by))
				.push(")");
		}
		qb.push(" ORDER BY id");
		if let Some(limit) = filter.limit {
			qb.push(" LIMIT ").push_bind(i64::from(limit));
		}

		let rows = qb
			.build_query_as::<DescriptorRow>()
			.fetch_all(&self.pool)
			.await?;
		rows.into_iter().map(JobDescriptor::try_from).collect()
	}

	#[tracing::instrument(skip(self), fields(descriptor_id = %id))]
	async fn delete(&self, id: DescriptorId) -> Result<bool> {
		let result = sqlx::query("DELETE FROM job_descriptors WHERE id = ?")
			.bind(id.0)
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self, from), fields(descriptor_id = %id, to = %to))]
	async fn transition(&self, id: DescriptorId, from: &[JobStatus], to: JobStatus) -> Result<bool> {
		if from.is_empty() {
			return Ok(false);
		}

		let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE job_descriptors SET status = ");
		qb.push_bind(to.as_str())
			.push(", updated_at = ")
			.push_bind(ts(Utc::now()))
			.push(" WHERE id = ")
			.push_bind(id.0)
			.push(" AND status IN (");
		let mut separated = qb.separated(", ");
		for status in from {
			separated.push_bind(status.as_str());
		}
		separated.push_unseparated(")");

		let result = qb.build().execute(&self.pool).await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self), fields(descriptor_id = %id, status = %status))]
	async fn set_status(&self, id: DescriptorId, status: JobStatus) -> Result<bool> {
		let result = sqlx::query("UPDATE job_descriptors SET status = ?, updated_at = ? WHERE id = ?")
			.bind(status.as_str())
			.bind(ts(Utc::now()))
			.bind(id.0)
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self, at), fields(descriptor_id = %id))]
	async fn mark_started(&self, id: DescriptorId, at: DateTime<Utc>) -> Result<bool> {
		let at = ts(at);
		let result = sqlx::query(
			r#"
			UPDATE job_descriptors SET
				status = 'running',
				restarted = CASE WHEN started IS NULL THEN restarted ELSE ? END,
				started = COALESCE(started, ?),
				updated_at = ?
			WHERE id = ? AND status = 'initializing'
			"#,
		)
		.bind(&at)
		.bind(&at)
		.bind(&at)
		.bind(id.0)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self, at), fields(descriptor_id = %id))]
	async fn mark_finished(&self, id: DescriptorId, at: DateTime<Utc>) -> Result<bool> {
		let at = ts(at);
		let result = sqlx::query(
			r#"
			UPDATE job_descriptors SET
				status = 'complete', finished = ?, lock_owner = NULL, lock_expiry = NULL, updated_at = ?
			WHERE id = ? AND status IN ('initializing', 'running')
			"#,
		)
		.bind(&at)
		.bind(&at)
		.bind(id.0)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self, checkpoint), fields(descriptor_id = %id, steps = checkpoint.steps_processed))]
	async fn checkpoint(&self, id: DescriptorId, checkpoint: &Checkpoint) -> Result<bool> {
		let saved_state = checkpoint
			.saved_state
			.as_ref()
			.map(serde_json::to_string)
			.transpose()?;
		let saved_messages = serde_json::to_string(&checkpoint.saved_messages)?;

		let result = sqlx::query(
			r#"
			UPDATE job_descriptors SET
				total_steps = ?,
				steps_processed = MAX(steps_processed, ?),
				saved_state = COALESCE(?, saved_state),
				saved_messages = ?,
				scratch_ref = ?,
				lock_expiry = CASE WHEN lock_owner IS NULL THEN lock_expiry ELSE ? END,
				updated_at = ?
			WHERE id = ? AND (? IS NULL OR lock_owner = ?)
			"#,
		)
		.bind(checkpoint.total_steps)
		.bind(checkpoint.steps_processed)
		.bind(saved_state)
		.bind(saved_messages)
		.bind(&checkpoint.scratch_ref)
		.bind(ts(checkpoint.lease_expiry))
		.bind(ts(Utc::now()))
		.bind(id.0)
		.bind(&checkpoint.lease_owner)
		.bind(&checkpoint.lease_owner)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self, start_after), fields(descriptor_id = %id))]
	async fn record_failure(
		&self,
		id: DescriptorId,
		failed_attempts: u32,
		start_after: DateTime<Utc>,
	) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE job_descriptors SET
				status = 'new', failed_attempts = ?, start_after = ?,
				lock_owner = NULL, lock_expiry = NULL, updated_at = ?
			WHERE id = ? AND status = 'broken'
			"#,
		)
		.bind(i64::from(failed_attempts))
		.bind(ts(start_after))
		.bind(ts(Utc::now()))
		.bind(id.0)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self), fields(descriptor_id = %id))]
	async fn record_stall_restart(&self, id: DescriptorId) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE job_descriptors SET
				status = 'waiting', resume_count = resume_count + 1,
				lock_owner = NULL, lock_expiry = NULL, updated_at = ?
			WHERE id = ?
				AND status IN ('initializing', 'running')
				AND steps_processed = last_processed_count
			"#,
		)
		.bind(ts(Utc::now()))
		.bind(id.0)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self), fields(lane = %lane))]
	async fn snapshot_progress(&self, lane: Lane) -> Result<u64> {
		let result = sqlx::query(
			r#"
			UPDATE job_descriptors SET last_processed_count = steps_processed
			WHERE lane = ? AND status IN ('initializing', 'running')
			"#,
		)
		.bind(lane.as_str())
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self, from), fields(descriptor_id = %id))]
	async fn reset_for_resume(&self, id: DescriptorId, from: &[JobStatus]) -> Result<bool> {
		if from.is_empty() {
			return Ok(false);
		}

		let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
			"UPDATE job_descriptors SET status = 'waiting', resume_count = 0, \
			 last_processed_count = -1, lock_owner = NULL, lock_expiry = NULL, updated_at = ",
		);
		qb.push_bind(ts(Utc::now()))
			.push(" WHERE id = ")
			.push_bind(id.0)
			.push(" AND status IN (");
		let mut separated = qb.separated(", ");
		for status in from {
			separated.push_bind(status.as_str());
		}
		separated.push_unseparated(")");

		let result = qb.build().execute(&self.pool).await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self, expiry), fields(descriptor_id = %id))]
	async fn claim_lease(&self, id: DescriptorId, owner: &str, expiry: DateTime<Utc>) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE job_descriptors SET
				status = 'initializing', lock_owner = ?, lock_expiry = ?, updated_at = ?
			WHERE id = ? AND status IN ('new', 'waiting')
			"#,
		)
		.bind(owner)
		.bind(ts(expiry))
		.bind(ts(Utc::now()))
		.bind(id.0)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self, expiry), fields(descriptor_id = %id))]
	async fn confirm_handoff(&self, id: DescriptorId, owner: &str, expiry: DateTime<Utc>) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE job_descriptors SET lock_expiry = ?, updated_at = ?
			WHERE id = ? AND status = 'initializing' AND lock_owner = ?
			"#,
		)
		.bind(ts(expiry))
		.bind(ts(Utc::now()))
		.bind(id.0)
		.bind(owner)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self), fields(descriptor_id = %id, restore = %restore))]
	async fn abandon_handoff(&self, id: DescriptorId, owner: &str, restore: JobStatus) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE job_descriptors SET
				status = ?, lock_owner = NULL, lock_expiry = NULL, updated_at = ?
			WHERE id = ? AND status = 'initializing' AND lock_owner = ?
			"#,
		)
		.bind(restore.as_str())
		.bind(ts(Utc::now()))
		.bind(id.0)
		.bind(owner)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self), fields(descriptor_id = %id))]
	async fn release_lease(&self, id: DescriptorId, owner: &str) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE job_descriptors SET lock_owner = NULL, lock_expiry = NULL, updated_at = ?
			WHERE id = ? AND lock_owner = ?
			"#,
		)
		.bind(ts(Utc::now()))
		.bind(id.0)
		.bind(owner)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self, now))]
	async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<DescriptorId>> {
		let now = ts(now);
		let ids: Vec<i64> = sqlx::query_scalar(
			r#"
			UPDATE job_descriptors SET
				status = 'waiting', lock_owner = NULL, lock_expiry = NULL, updated_at = ?
			WHERE status IN ('initializing', 'running')
				AND lock_owner IS NOT NULL
				AND lock_expiry < ?
			RETURNING id
			"#,
		)
		.bind(&now)
		.bind(&now)
		.fetch_all(&self.pool)
		.await?;

		let mut ids: Vec<DescriptorId> = ids.into_iter().map(DescriptorId).collect();
		ids.sort();
		if !ids.is_empty() {
			tracing::warn!(count = ids.len(), "reclaimed expired worker leases");
		}
		Ok(ids)
	}

	#[tracing::instrument(skip(self))]
	async fn count_leased_active(&self) -> Result<u64> {
		let count: i64 = sqlx::query_scalar(
			r#"
			SELECT COUNT(*) FROM job_descriptors
			WHERE status IN ('initializing', 'running') AND lock_owner IS NOT NULL
			"#,
		)
		.fetch_one(&self.pool)
		.await?;
		Ok(count.max(0) as u64)
	}

	#[tracing::instrument(skip(self, cutoff))]
	async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64> {
		let result = sqlx::query(
			r#"
			DELETE FROM job_descriptors WHERE id IN (
				SELECT id FROM job_descriptors
				WHERE status IN ('complete', 'cancelled') AND updated_at < ?
				ORDER BY id
				LIMIT ?
			)
			"#,
		)
		.bind(ts(cutoff))
		.bind(i64::from(limit))
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}
}

#[derive(sqlx::FromRow)]
struct DescriptorRow {
	id: i64,
	signature: String,
	implementation: String,
	title: String,
	lane: String,
	status: String,
	start_after: Option<String>,
	started: Option<String>,
	restarted: Option<String>,
	finished: Option<String>,
	total_steps: i64,
	steps_processed: i64,
	last_processed_count: i64,
	resume_count: i64,
	failed_attempts: i64,
	saved_state: String,
	saved_messages: String,
	run_as: Option<String>,
	lock_owner: Option<String>,
	lock_expiry: Option<String>,
	scratch_ref: Option<String>,
	created_at: String,
	updated_at: String,
}

impl TryFrom<DescriptorRow> for JobDescriptor {
	type Error = JobsError;

	fn try_from(row: DescriptorRow) -> Result<Self> {
		Ok(JobDescriptor {
			id: DescriptorId(row.id),
			lane: row.lane.parse().map_err(JobsError::Internal)?,
			status: row.status.parse().map_err(JobsError::Internal)?,
			start_after: parse_opt_ts(row.start_after)?,
			started: parse_opt_ts(row.started)?,
			restarted: parse_opt_ts(row.restarted)?,
			finished: parse_opt_ts(row.finished)?,
			total_steps: row.total_steps,
			steps_processed: row.steps_processed,
			last_processed_count: row.last_processed_count,
			resume_count: u32::try_from(row.resume_count)
				.map_err(|_| JobsError::Internal("Invalid resume_count".to_string()))?,
			failed_attempts: u32::try_from(row.failed_attempts)
				.map_err(|_| JobsError::Internal("Invalid failed_attempts".to_string()))?,
			saved_state: serde_json::from_str(&row.saved_state)?,
			saved_messages: serde_json::from_str(&row.saved_messages)?,
			run_as: row.run_as,
			lock_owner: row.lock_owner,
			lock_expiry: parse_opt_ts(row.lock_expiry)?,
			scratch_ref: row.scratch_ref,
			created_at: parse_ts(&row.created_at)?,
			updated_at: parse_ts(&row.updated_at)?,
			signature: row.signature,
			implementation: row.implementation,
			title: row.title,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{new_descriptor, test_store};
	use chrono::Duration;
	use keel_jobs_core::{JobMessage, Severity};

	#[tokio::test]
	async fn test_create_unique_dedups_unstarted() {
		let store = test_store().await;
		let first = store
			.create_unique(&new_descriptor("export", Lane::Standard, serde_json::json!({"n": 1})))
			.await
			.unwrap();
		let second = store
			.create_unique(&new_descriptor("export", Lane::Standard, serde_json::json!({"n": 1})))
			.await
			.unwrap();

		assert!(first.was_created());
		assert!(!second.was_created());
		assert_eq!(first.descriptor().id, second.descriptor().id);

		let created = first.descriptor();
		assert_eq!(created.status, JobStatus::New);
		assert_eq!(created.last_processed_count, -1);
		assert_eq!(created.saved_state, serde_json::json!({"n": 1}));
	}

	#[tokio::test]
	async fn test_create_unique_after_start_inserts_new_row() {
		let store = test_store().await;
		let new = new_descriptor("export", Lane::Standard, serde_json::json!({"n": 1}));
		let first = store.create_unique(&new).await.unwrap().descriptor().id;
		assert!(store
			.transition(first, &[JobStatus::New], JobStatus::Running)
			.await
			.unwrap());

		let second = store.create_unique(&new).await.unwrap();
		assert!(second.was_created());
		assert!(second.descriptor().id > first);
	}

	#[tokio::test]
	async fn test_find_filters_and_orders() {
		let store = test_store().await;
		let now = Utc::now();
		let a = store
			.create_unique(&new_descriptor("a", Lane::Standard, serde_json::json!(1)))
			.await
			.unwrap()
			.descriptor()
			.id;
		let mut later = new_descriptor("b", Lane::Standard, serde_json::json!(2));
		later.start_after = Some(now + Duration::hours(1));
		let b = store.create_unique(&later).await.unwrap().descriptor().id;
		store
			.create_unique(&new_descriptor("c", Lane::Large, serde_json::json!(3)))
			.await
			.unwrap();

		let standard = store
			.find(&DescriptorFilter::new().lane(Lane::Standard))
			.await
			.unwrap();
		assert_eq!(standard.iter().map(|d| d.id).collect::<Vec<_>>(), vec![a, b]);

		let due = store
			.find(&DescriptorFilter::new().lane(Lane::Standard).due_by(now))
			.await
			.unwrap();
		assert_eq!(due.iter().map(|d| d.id).collect::<Vec<_>>(), vec![a]);

		let limited = store.find(&DescriptorFilter::new().limit(1)).await.unwrap();
		assert_eq!(limited.len(), 1);
		assert_eq!(limited[0].id, a);
	}

	#[tokio::test]
	async fn test_transition_is_conditional() {
		let store = test_store().await;
		let id = store
			.create_unique(&new_descriptor("a", Lane::Standard, serde_json::json!(1)))
			.await
			.unwrap()
			.descriptor()
			.id;

		assert!(store
			.transition(id, JobStatus::CLAIMABLE, JobStatus::Initializing)
			.await
			.unwrap());
		assert!(!store
			.transition(id, JobStatus::CLAIMABLE, JobStatus::Initializing)
			.await
			.unwrap());
		assert!(!store.transition(id, &[], JobStatus::Paused).await.unwrap());
	}

	#[tokio::test]
	async fn test_mark_started_stamps_started_then_restarted() {
		let store = test_store().await;
		let id = store
			.create_unique(&new_descriptor("a", Lane::Standard, serde_json::json!(1)))
			.await
			.unwrap()
			.descriptor()
			.id;

		store
			.transition(id, JobStatus::CLAIMABLE, JobStatus::Initializing)
			.await
			.unwrap();
		assert!(store.mark_started(id, Utc::now()).await.unwrap());
		let first = store.get(id).await.unwrap().unwrap();
		assert_eq!(first.status, JobStatus::Running);
		assert!(first.started.is_some());
		assert!(first.restarted.is_none());

		assert!(!store.mark_started(id, Utc::now()).await.unwrap());

		store
			.transition(id, &[JobStatus::Running], JobStatus::Initializing)
			.await
			.unwrap();
		store.mark_started(id, Utc::now()).await.unwrap();
		let second = store.get(id).await.unwrap().unwrap();
		assert_eq!(second.started, first.started);
		assert!(second.restarted.is_some());
	}

	#[tokio::test]
	async fn test_checkpoint_never_lowers_steps_or_writes_status() {
		let store = test_store().await;
		let id = store
			.create_unique(&new_descriptor("a", Lane::Standard, serde_json::json!({"cursor": 0})))
			.await
			.unwrap()
			.descriptor()
			.id;
		store.set_status(id, JobStatus::Running).await.unwrap();

		let mut checkpoint = Checkpoint {
			total_steps: 10,
			steps_processed: 4,
			saved_state: Some(serde_json::json!({"cursor": 4})),
			saved_messages: vec![JobMessage::new("four", Severity::Info)],
			scratch_ref: None,
			lease_owner: None,
			lease_expiry: Utc::now(),
		};
		assert!(store.checkpoint(id, &checkpoint).await.unwrap());

		checkpoint.steps_processed = 2;
		checkpoint.saved_state = None;
		assert!(store.checkpoint(id, &checkpoint).await.unwrap());

		let descriptor = store.get(id).await.unwrap().unwrap();
		assert_eq!(descriptor.steps_processed, 4);
		assert_eq!(descriptor.total_steps, 10);
		assert_eq!(descriptor.saved_state, serde_json::json!({"cursor": 4}));
		assert_eq!(descriptor.saved_messages.len(), 1);
		assert_eq!(descriptor.status, JobStatus::Running);
		assert!(descriptor.lock_expiry.is_none());
	}

	#[tokio::test]
	async fn test_checkpoint_rejected_after_lease_lost() {
		let store = test_store().await;
		let id = store
			.create_unique(&new_descriptor("a", Lane::Standard, serde_json::json!(1)))
			.await
			.unwrap()
			.descriptor()
			.id;
		let expiry = Utc::now() + Duration::minutes(10);
		assert!(store.claim_lease(id, "owner-a", expiry).await.unwrap());
		assert!(store.confirm_handoff(id, "owner-a", expiry).await.unwrap());
		assert!(!store.confirm_handoff(id, "owner-b", expiry).await.unwrap());

		let checkpoint = Checkpoint {
			total_steps: 1,
			steps_processed: 1,
			saved_state: None,
			saved_messages: Vec::new(),
			scratch_ref: None,
			lease_owner: Some("owner-b".to_string()),
			lease_expiry: expiry,
		};
		assert!(!store.checkpoint(id, &checkpoint).await.unwrap());
		assert_eq!(store.get(id).await.unwrap().unwrap().steps_processed, 0);
	}

	#[tokio::test]
	async fn test_record_failure_requires_broken() {
		let store = test_store().await;
		let id = store
			.create_unique(&new_descriptor("a", Lane::Standard, serde_json::json!(1)))
			.await
			.unwrap()
			.descriptor()
			.id;
		let at = Utc::now() + Duration::seconds(30);

		assert!(!store.record_failure(id, 1, at).await.unwrap());
		store.set_status(id, JobStatus::Broken).await.unwrap();
		assert!(store.record_failure(id, 1, at).await.unwrap());

		let descriptor = store.get(id).await.unwrap().unwrap();
		assert_eq!(descriptor.status, JobStatus::New);
		assert_eq!(descriptor.failed_attempts, 1);
		assert!(!descriptor.is_due(Utc::now()));
	}

	#[tokio::test]
	async fn test_stall_restart_only_when_progress_unchanged() {
		let store = test_store().await;
		let id = store
			.create_unique(&new_descriptor("a", Lane::Standard, serde_json::json!(1)))
			.await
			.unwrap()
			.descriptor()
			.id;
		store.set_status(id, JobStatus::Running).await.unwrap();

		// -1 snapshot never matches
		assert!(!store.record_stall_restart(id).await.unwrap());
		assert_eq!(store.snapshot_progress(Lane::Standard).await.unwrap(), 1);
		assert_eq!(store.snapshot_progress(Lane::Large).await.unwrap(), 0);
		assert!(store.record_stall_restart(id).await.unwrap());

		let descriptor = store.get(id).await.unwrap().unwrap();
		assert_eq!(descriptor.status, JobStatus::Waiting);
		assert_eq!(descriptor.resume_count, 1);
	}

	#[tokio::test]
	async fn test_reset_for_resume() {
		let store = test_store().await;
		let id = store
			.create_unique(&new_descriptor("a", Lane::Standard, serde_json::json!(1)))
			.await
			.unwrap()
			.descriptor()
			.id;
		store.set_status(id, JobStatus::Running).await.unwrap();
		store.snapshot_progress(Lane::Standard).await.unwrap();
		store.record_stall_restart(id).await.unwrap();
		store.set_status(id, JobStatus::Paused).await.unwrap();

		assert!(store
			.reset_for_resume(id, &[JobStatus::Paused, JobStatus::Broken])
			.await
			.unwrap());
		let descriptor = store.get(id).await.unwrap().unwrap();
		assert_eq!(descriptor.status, JobStatus::Waiting);
		assert_eq!(descriptor.resume_count, 0);
		assert_eq!(descriptor.last_processed_count, -1);
	}

	#[tokio::test]
	async fn test_lease_lifecycle() {
		let store = test_store().await;
		let id = store
			.create_unique(&new_descriptor("a", Lane::Standard, serde_json::json!(1)))
			.await
			.unwrap()
			.descriptor()
			.id;
		let now = Utc::now();

		assert!(store
			.claim_lease(id, "owner-a", now - Duration::seconds(1))
			.await
			.unwrap());
		assert!(!store
			.claim_lease(id, "owner-b", now + Duration::minutes(5))
			.await
			.unwrap());
		assert_eq!(store.count_leased_active().await.unwrap(), 1);

		let reclaimed = store.reclaim_expired_leases(now).await.unwrap();
		assert_eq!(reclaimed, vec![id]);
		let descriptor = store.get(id).await.unwrap().unwrap();
		assert_eq!(descriptor.status, JobStatus::Waiting);
		assert!(descriptor.lock_owner.is_none());
		assert_eq!(store.count_leased_active().await.unwrap(), 0);

		assert!(store
			.claim_lease(id, "owner-c", now + Duration::minutes(5))
			.await
			.unwrap());
		assert!(store.reclaim_expired_leases(now).await.unwrap().is_empty());
		assert!(!store
			.abandon_handoff(id, "owner-a", JobStatus::Waiting)
			.await
			.unwrap());
		assert!(store
			.abandon_handoff(id, "owner-c", JobStatus::Waiting)
			.await
			.unwrap());
		assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Waiting);

		store
			.claim_lease(id, "owner-d", now + Duration::minutes(5))
			.await
			.unwrap();
		assert!(!store.release_lease(id, "owner-c").await.unwrap());
		assert!(store.release_lease(id, "owner-d").await.unwrap());
	}

	#[tokio::test]
	async fn test_mark_finished_and_purge() {
		let store = test_store().await;
		let done = store
			.create_unique(&new_descriptor("a", Lane::Standard, serde_json::json!(1)))
			.await
			.unwrap()
			.descriptor()
			.id;
		let pending = store
			.create_unique(&new_descriptor("b", Lane::Standard, serde_json::json!(2)))
			.await
			.unwrap()
			.descriptor()
			.id;

		assert!(!store.mark_finished(done, Utc::now()).await.unwrap());
		store.set_status(done, JobStatus::Running).await.unwrap();
		assert!(store.mark_finished(done, Utc::now()).await.unwrap());
		let finished = store.get(done).await.unwrap().unwrap();
		assert_eq!(finished.status, JobStatus::Complete);
		assert!(finished.finished.is_some());

		let purged = store
			.purge_finished_before(Utc::now() + Duration::seconds(1), 100)
			.await
			.unwrap();
		assert_eq!(purged, 1);
		assert!(store.get(done).await.unwrap().is_none());
		assert!(store.get(pending).await.unwrap().is_some());
		assert!(store.delete(pending).await.unwrap());
		assert!(!store.delete(pending).await.unwrap());
	}
}
