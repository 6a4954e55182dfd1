// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wiring between resolved configuration and the job engine.

pub mod error;
pub mod jobs;
pub mod version;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keel_jobs_core::{DescriptorId, JobRegistry};
use keel_server_config::{DatabaseConfig, JobsConfig, RunnerConfig, ServerConfig};
use keel_server_jobs::{
	create_pool_with, migrate, Coordinator, DescriptorStore, EngineSettings, EnqueueOptions,
	JobService, LaneScheduler, LoadCeiling, MaxProcesses, MemoryCeiling, PoolSettings,
	ProcessSpawner, ResourceProbe, SqliteDescriptorStore, SysinfoProbe, TracingNotifier,
	WorkerSpawner,
};

pub use error::{Result, ServerError};
use jobs::DescriptorPurgeJob;

/// Map the `[jobs]` section onto engine tunables.
pub fn engine_settings(config: &JobsConfig) -> EngineSettings {
	EngineSettings {
		stall_threshold: config.stall_threshold,
		max_retry_attempts: config.max_retry_attempts,
		retry_allow_list: config.retry_allow_list.clone(),
		memory_limit_bytes: config.memory_limit_bytes(),
		time_limit: config.time_limit(),
		lock_ttl: Duration::from_secs(config.lock_ttl_secs),
	}
}

/// Map the `[database]` section onto pool tunables.
pub fn pool_settings(config: &DatabaseConfig) -> PoolSettings {
	PoolSettings {
		max_connections: config.max_connections,
		busy_timeout: config.busy_timeout(),
		wal: config.wal,
	}
}

/// Registry of every job implementation this server can run.
pub fn job_registry(store: Arc<dyn DescriptorStore>) -> JobRegistry {
	JobRegistry::new().with(jobs::DESCRIPTOR_PURGE, move || {
		Box::new(DescriptorPurgeJob::blank(Arc::clone(&store)))
	})
}

/// Everything a subcommand needs, built once from configuration.
pub struct ServerContext {
	pub config: ServerConfig,
	pub store: Arc<dyn DescriptorStore>,
	pub service: Arc<JobService>,
	probe: Arc<dyn ResourceProbe>,
}

impl ServerContext {
	#[tracing::instrument(skip(config), fields(database = %config.database.url))]
	pub async fn connect(config: ServerConfig) -> Result<Self> {
		let pool =
			create_pool_with(&config.database.url, &pool_settings(&config.database)).await?;
		migrate(&pool).await?;

		let store: Arc<dyn DescriptorStore> = Arc::new(SqliteDescriptorStore::new(pool));
		let registry = Arc::new(job_registry(Arc::clone(&store)));
		let probe: Arc<dyn ResourceProbe> = Arc::new(SysinfoProbe::new());

		tracing::debug!(implementations = ?registry.implementations(), "job registry ready");

		let service = JobService::builder(Arc::clone(&store), registry)
			.settings(engine_settings(&config.jobs))
			.notifier(Arc::new(TracingNotifier))
			.probe(Arc::clone(&probe))
			.build();

		Ok(Self {
			config,
			store,
			service: Arc::new(service),
			probe,
		})
	}

	pub fn health_interval(&self) -> Duration {
		Duration::from_secs(self.config.jobs.health_check_interval_secs)
	}

	pub fn tick_interval(&self) -> Duration {
		Duration::from_secs(self.config.runner.tick_interval_secs)
	}

	pub fn lane_scheduler(&self) -> LaneScheduler {
		LaneScheduler::new(
			Arc::clone(&self.service),
			self.tick_interval(),
			self.health_interval(),
		)
	}

	/// Coordinator spawning workers through `spawner`, admission-limited by
	/// the `[runner]` section.
	pub fn coordinator(&self, spawner: Arc<dyn WorkerSpawner>) -> Coordinator {
		let runner = &self.config.runner;
		Coordinator::new(
			Arc::clone(&self.store),
			self.service.dispatcher().clone(),
			spawner,
			Arc::clone(&self.probe),
		)
		.with_rule(MaxProcesses(runner.max_processes))
		.with_rule(MemoryCeiling(runner.max_memory_percent))
		.with_rule(LoadCeiling(runner.max_load_per_cpu))
		.with_lock_ttl(self.service.settings().lock_ttl_chrono())
		.with_tick_interval(self.tick_interval())
	}

	/// Queue a purge of finished descriptors past the retention window.
	/// Repeated calls collapse onto the one still waiting to start.
	pub async fn schedule_purge(&self) -> Result<DescriptorId> {
		let job = DescriptorPurgeJob::new(
			Arc::clone(&self.store),
			self.config.jobs.finished_retention_days,
		);
		Ok(self.service.enqueue(&job, EnqueueOptions::default()).await?)
	}
}

/// Spawner that re-executes `keel-server run-job` for each handed-off
/// descriptor, forwarding the config file so workers see the same settings.
pub fn worker_spawner(runner: &RunnerConfig, config_path: Option<&PathBuf>) -> Result<ProcessSpawner> {
	let program = match &runner.worker_command {
		Some(path) => path.clone(),
		None => std::env::current_exe().map_err(ServerError::WorkerCommand)?,
	};

	let args = config_path
		.map(|path| vec!["--config".to_string(), path.display().to_string()])
		.unwrap_or_default();

	Ok(ProcessSpawner::new(program).with_args(args))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_engine_settings_follow_config() {
		let settings = engine_settings(&JobsConfig {
			stall_threshold: 5,
			retry_allow_list: vec!["export".to_string()],
			memory_limit_mb: 0,
			time_limit_secs: 60,
			lock_ttl_secs: 120,
			..JobsConfig::default()
		});
		assert_eq!(settings.stall_threshold, 5);
		assert_eq!(settings.retry_allow_list, vec!["export".to_string()]);
		assert_eq!(settings.memory_limit_bytes, None);
		assert_eq!(settings.time_limit, Some(Duration::from_secs(60)));
		assert_eq!(settings.lock_ttl, Duration::from_secs(120));
	}

	#[test]
	fn test_default_config_matches_engine_defaults() {
		assert_eq!(
			engine_settings(&JobsConfig::default()),
			EngineSettings::default()
		);
	}

	#[test]
	fn test_default_database_config_matches_pool_defaults() {
		assert_eq!(pool_settings(&DatabaseConfig::default()), PoolSettings::default());

		let settings = pool_settings(&DatabaseConfig {
			max_connections: 1,
			busy_timeout_secs: 30,
			wal: false,
			..DatabaseConfig::default()
		});
		assert_eq!(settings.max_connections, 1);
		assert_eq!(settings.busy_timeout, Duration::from_secs(30));
		assert!(!settings.wal);
	}

	#[test]
	fn test_worker_spawner_resolves_current_exe() {
		let runner = RunnerConfig::default();
		assert!(worker_spawner(&runner, None).is_ok());

		let runner = RunnerConfig {
			worker_command: Some(PathBuf::from("/usr/local/bin/keel-server")),
			..RunnerConfig::default()
		};
		assert!(worker_spawner(&runner, Some(&PathBuf::from("/etc/keel/server.toml"))).is_ok());
	}
}
