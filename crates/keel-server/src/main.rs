// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Keel job server binary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use keel_jobs_core::{DescriptorId, Lane};
use keel_server::{worker_spawner, ServerContext};
use keel_server_config::{LogFormat, LoggingConfig, ServerConfig};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Keel - durable background job server.
#[derive(Parser, Debug)]
#[command(name = "keel-server", about = "Durable background job server", version)]
struct Args {
	/// Config file (defaults to /etc/keel/server.toml)
	#[arg(long, global = true, env = "KEEL_SERVER_CONFIG")]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run jobs from one lane until it is idle or busy
	RunLane {
		#[arg(long, default_value = "standard")]
		lane: Lane,
	},
	/// Run a single descriptor, optionally as a handed-off worker
	RunJob {
		#[arg(long)]
		id: i64,
		/// Lease owner token issued by the coordinator
		#[arg(long)]
		lock_owner: Option<String>,
	},
	/// Sweep active jobs for stalls
	CheckHealth {
		/// Lane to sweep (all lanes when omitted)
		#[arg(long)]
		lane: Option<Lane>,
	},
	/// Print jobs waiting in a lane as JSON
	ListPending {
		#[arg(long, default_value = "standard")]
		lane: Lane,
	},
	/// Hand pending descriptors to detached worker processes
	Coordinate {
		/// Run a single tick and print its report
		#[arg(long)]
		once: bool,
	},
	/// Run every lane in-process until interrupted
	Daemon,
	/// Pause a job at its next checkpoint
	Pause {
		#[arg(long)]
		id: i64,
	},
	/// Requeue a paused or broken job
	Resume {
		#[arg(long)]
		id: i64,
	},
	/// Cancel a job that has not finished
	Cancel {
		#[arg(long)]
		id: i64,
	},
	/// Queue a purge of old finished descriptors
	Purge,
	/// Show version and build information
	Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
	let args = Args::parse();

	if let Command::Version = args.command {
		println!("{}", keel_server::version::format_version_info());
		return Ok(ExitCode::SUCCESS);
	}

	// Load .env file if present
	dotenvy::dotenv().ok();

	let config = load_config(args.config.as_ref())?;
	init_tracing(&config.logging);

	tracing::info!(
		database = %config.database.url,
		command = ?args.command,
		"starting keel-server"
	);

	let ctx = ServerContext::connect(config)
		.await
		.context("failed to open job store")?;

	match args.command {
		Command::RunLane { lane } => {
			let drain = ctx.service.drain_lane(lane).await?;
			for (id, outcome) in drain.ran.iter().chain(&drain.flushed) {
				tracing::info!(descriptor_id = %id, outcome = ?outcome, "lane run finished");
			}
			tracing::info!(
				lane = %lane,
				ran = drain.ran.len(),
				flushed = drain.flushed.len(),
				"lane drained"
			);
		}
		Command::RunJob { id, lock_owner } => {
			let id = DescriptorId(id);
			let outcome = match lock_owner.as_deref() {
				Some(owner) => ctx.service.run_handoff(id, owner).await?,
				None => ctx.service.run_job(id).await?,
			};
			tracing::info!(descriptor_id = %id, outcome = ?outcome, "job run finished");
			flush_immediate(&ctx).await?;
			if !outcome.is_success() {
				return Ok(ExitCode::FAILURE);
			}
		}
		Command::CheckHealth { lane } => {
			let lanes = lane.map(|l| vec![l]).unwrap_or_else(|| Lane::ALL.to_vec());
			for lane in lanes {
				let report = ctx.service.check_health(lane).await?;
				println!("{}", serde_json::to_string(&report)?);
			}
		}
		Command::ListPending { lane } => {
			let pending = ctx.service.list_pending(lane).await?;
			println!("{}", serde_json::to_string_pretty(&pending)?);
		}
		Command::Coordinate { once } => {
			let spawner = Arc::new(worker_spawner(&ctx.config.runner, args.config.as_ref())?);
			let coordinator = ctx.coordinator(spawner);
			if once {
				let report = coordinator.tick().await?;
				println!("{}", serde_json::to_string_pretty(&report)?);
			} else {
				let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
				let run = coordinator.run(shutdown_rx);
				tokio::pin!(run);
				tokio::select! {
					_ = &mut run => {}
					result = tokio::signal::ctrl_c() => {
						result?;
						tracing::info!("interrupt received, stopping coordinator");
						let _ = shutdown_tx.send(());
						run.await;
					}
				}
			}
		}
		Command::Daemon => run_daemon(&ctx).await?,
		Command::Pause { id } => report_control("pause", ctx.service.pause(DescriptorId(id)).await?),
		Command::Resume { id } => {
			report_control("resume", ctx.service.resume(DescriptorId(id)).await?)
		}
		Command::Cancel { id } => {
			report_control("cancel", ctx.service.cancel(DescriptorId(id)).await?)
		}
		Command::Purge => {
			let id = ctx.schedule_purge().await?;
			flush_immediate(&ctx).await?;
			println!("{id}");
		}
		// handled above
		Command::Version => {}
	}

	Ok(ExitCode::SUCCESS)
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ServerConfig> {
	let config = match path {
		Some(path) => keel_server_config::load_config_with_file(path),
		None => keel_server_config::load_config(),
	};
	config.context("failed to load configuration")
}

fn init_tracing(logging: &LoggingConfig) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| logging.level.clone().into());
	let (json, text) = match logging.format {
		LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
		LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer())),
	};

	tracing_subscriber::registry()
		.with(filter)
		.with(json)
		.with(text)
		.init();
}

fn report_control(action: &str, applied: bool) {
	if applied {
		println!("{action}: ok");
	} else {
		println!("{action}: job is not in a state that allows it");
	}
}

/// Run the Immediate-lane jobs this command enqueued before exiting.
async fn flush_immediate(ctx: &ServerContext) -> anyhow::Result<()> {
	for (id, outcome) in ctx.service.flush_immediate().await? {
		tracing::info!(descriptor_id = %id, outcome = ?outcome, "immediate job finished");
	}
	Ok(())
}

async fn run_daemon(ctx: &ServerContext) -> anyhow::Result<()> {
	let scheduler = ctx.lane_scheduler();
	scheduler.start().await;

	let mut purge = tokio::time::interval(PURGE_INTERVAL);
	loop {
		tokio::select! {
			_ = purge.tick() => {
				if let Err(e) = ctx.schedule_purge().await {
					tracing::warn!(error = %e, "failed to schedule descriptor purge");
				}
			}
			result = tokio::signal::ctrl_c() => {
				result?;
				tracing::info!("interrupt received, stopping lane scheduler");
				break;
			}
		}
	}

	scheduler.shutdown().await;
	Ok(())
}
