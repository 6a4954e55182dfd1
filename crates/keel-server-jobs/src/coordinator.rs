// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Multi-process engine.
//!
//! The coordinator never runs jobs itself. Each tick it reclaims lapsed
//! worker leases, then keeps leasing the next candidate descriptor and
//! spawning a detached `run-job` worker for it until an admission rule
//! refuses or nothing is left to run.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use keel_jobs_core::DescriptorId;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::dispatcher::LaneDispatcher;
use crate::error::{JobsError, Result};
use crate::resources::{ResourceProbe, SystemLoad};
use crate::store::DescriptorStore;

/// Inputs to admission decisions, sampled before every spawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionSample {
	pub active_workers: u64,
	pub load: SystemLoad,
}

pub trait AdmissionRule: Send + Sync {
	/// `Err` carries the reason the next worker may not start.
	fn admit(&self, sample: &AdmissionSample) -> std::result::Result<(), String>;
}

#[derive(Debug, Clone, Copy)]
pub struct MaxProcesses(pub u64);

impl AdmissionRule for MaxProcesses {
	fn admit(&self, sample: &AdmissionSample) -> std::result::Result<(), String> {
		if sample.active_workers >= self.0 {
			return Err(format!("{} of {} workers busy", sample.active_workers, self.0));
		}
		Ok(())
	}
}

/// Refuse while host memory use is at or above this percentage.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCeiling(pub f64);

impl AdmissionRule for MemoryCeiling {
	fn admit(&self, sample: &AdmissionSample) -> std::result::Result<(), String> {
		if sample.load.memory_used_percent >= self.0 {
			return Err(format!(
				"memory at {:.1}% (ceiling {:.1}%)",
				sample.load.memory_used_percent, self.0
			));
		}
		Ok(())
	}
}

/// Refuse while the one-minute load per CPU is at or above this value.
#[derive(Debug, Clone, Copy)]
pub struct LoadCeiling(pub f64);

impl AdmissionRule for LoadCeiling {
	fn admit(&self, sample: &AdmissionSample) -> std::result::Result<(), String> {
		if sample.load.load_per_cpu >= self.0 {
			return Err(format!(
				"load {:.2} per cpu (ceiling {:.2})",
				sample.load.load_per_cpu, self.0
			));
		}
		Ok(())
	}
}

pub trait WorkerSpawner: Send + Sync {
	/// Start a worker for a leased descriptor. Returns the worker pid.
	fn spawn(&self, id: DescriptorId, owner: &str) -> std::io::Result<u32>;

	/// Collect exited workers. Returns how many were reaped.
	fn reap(&self) -> usize {
		0
	}
}

/// Spawns `<program> [args..] run-job --id N --lock-owner T` detached in
/// its own process group, so workers outlive the coordinator.
pub struct ProcessSpawner {
	program: PathBuf,
	args: Vec<String>,
	children: Mutex<Vec<Child>>,
}

impl ProcessSpawner {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			children: Mutex::new(Vec::new()),
		}
	}

	/// Arguments placed before the `run-job` subcommand (e.g. `--config`).
	pub fn with_args(mut self, args: Vec<String>) -> Self {
		self.args = args;
		self
	}

	fn command(&self, id: DescriptorId, owner: &str) -> Command {
		let mut command = Command::new(&self.program);
		command
			.args(&self.args)
			.arg("run-job")
			.arg("--id")
			.arg(id.to_string())
			.arg("--lock-owner")
			.arg(owner)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null());
		#[cfg(unix)]
		{
			use std::os::unix::process::CommandExt;
			command.process_group(0);
		}
		command
	}
}

impl WorkerSpawner for ProcessSpawner {
	fn spawn(&self, id: DescriptorId, owner: &str) -> std::io::Result<u32> {
		let child = self.command(id, owner).spawn()?;
		let pid = child.id();
		self.children
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.push(child);
		Ok(pid)
	}

	fn reap(&self) -> usize {
		let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
		let before = children.len();
		children.retain_mut(|child| match child.try_wait() {
			Ok(Some(status)) => {
				tracing::debug!(pid = child.id(), %status, "worker exited");
				false
			}
			Ok(None) => true,
			Err(e) => {
				tracing::warn!(pid = child.id(), error = %e, "failed to poll worker");
				true
			}
		});
		before - children.len()
	}
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TickReport {
	pub reaped: usize,
	pub reclaimed: Vec<DescriptorId>,
	pub spawned: Vec<DescriptorId>,
	/// Admission refusal that ended the tick, if any.
	pub refused: Option<String>,
	pub failed: Vec<(DescriptorId, String)>,
}

pub struct Coordinator {
	store: Arc<dyn DescriptorStore>,
	dispatcher: LaneDispatcher,
	spawner: Arc<dyn WorkerSpawner>,
	probe: Arc<dyn ResourceProbe>,
	rules: Vec<Box<dyn AdmissionRule>>,
	lock_ttl: chrono::Duration,
	tick_interval: Duration,
}

impl Coordinator {
	pub fn new(
		store: Arc<dyn DescriptorStore>,
		dispatcher: LaneDispatcher,
		spawner: Arc<dyn WorkerSpawner>,
		probe: Arc<dyn ResourceProbe>,
	) -> Self {
		Self {
			store,
			dispatcher,
			spawner,
			probe,
			rules: Vec::new(),
			lock_ttl: chrono::Duration::minutes(10),
			tick_interval: Duration::from_secs(5),
		}
	}

	pub fn with_rule(mut self, rule: impl AdmissionRule + 'static) -> Self {
		self.rules.push(Box::new(rule));
		self
	}

	pub fn with_lock_ttl(mut self, ttl: chrono::Duration) -> Self {
		self.lock_ttl = ttl;
		self
	}

	pub fn with_tick_interval(mut self, interval: Duration) -> Self {
		self.tick_interval = interval;
		self
	}

	async fn sample(&self) -> Result<AdmissionSample> {
		Ok(AdmissionSample {
			active_workers: self.store.count_leased_active().await?,
			load: self.probe.system_load(),
		})
	}

	#[tracing::instrument(skip(self))]
	pub async fn tick(&self) -> Result<TickReport> {
		let mut report = TickReport {
			reaped: self.spawner.reap(),
			reclaimed: self.store.reclaim_expired_leases(Utc::now()).await?,
			..TickReport::default()
		};

		loop {
			let sample = self.sample().await?;
			if let Some(reason) = self.rules.iter().find_map(|rule| rule.admit(&sample).err()) {
				tracing::debug!(%reason, "admission refused");
				report.refused = Some(reason);
				break;
			}

			let Some(candidate) = self.dispatcher.next_candidate(Utc::now()).await? else {
				break;
			};

			let owner = Uuid::new_v4().to_string();
			let expiry = Utc::now() + self.lock_ttl;
			if !self
				.store
				.claim_lease(candidate.id, &owner, expiry)
				.await?
			{
				continue;
			}

			match self.spawner.spawn(candidate.id, &owner) {
				Ok(pid) => {
					tracing::info!(
						descriptor_id = %candidate.id,
						lane = %candidate.lane,
						pid,
						"worker spawned"
					);
					report.spawned.push(candidate.id);
				}
				Err(source) => {
					self.store
						.abandon_handoff(candidate.id, &owner, candidate.status)
						.await?;
					let error = JobsError::Spawn {
						id: candidate.id,
						source,
					};
					tracing::error!(error = %error, "worker spawn failed, lease released");
					report.failed.push((candidate.id, error.to_string()));
					break;
				}
			}
		}

		Ok(report)
	}

	/// Tick until shutdown. Spawned workers are left running.
	pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
		tracing::info!(interval_secs = self.tick_interval.as_secs(), "coordinator started");
		loop {
			match self.tick().await {
				Ok(report) if !report.spawned.is_empty() || !report.reclaimed.is_empty() => {
					tracing::info!(
						spawned = report.spawned.len(),
						reclaimed = report.reclaimed.len(),
						reaped = report.reaped,
						"coordinator tick"
					);
				}
				Ok(_) => {}
				Err(e) => tracing::warn!(error = %e, "coordinator tick failed"),
			}

			tokio::select! {
				_ = tokio::time::sleep(self.tick_interval) => {}
				_ = shutdown.recv() => {
					tracing::info!("Shutting down coordinator");
					break;
				}
			}
		}
	}
}
