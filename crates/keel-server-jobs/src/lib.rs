// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable job execution engine for Keel server.
//!
//! Jobs are persisted as descriptors in SQLite and run in bounded steps with
//! a checkpoint after each one, so work survives process restarts. Runners
//! coordinate only through conditional status updates on the descriptor row.
//! Two engines share the same store: the in-process [`LaneScheduler`] that
//! runs one job per lane at a time, and the multi-process [`Coordinator`]
//! that leases descriptors to detached worker processes.

pub mod channels;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod pool;
pub mod resources;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod sqlite;
pub mod store;

#[cfg(test)]
mod testing;

pub use channels::{
	AmbientIdentity, DeferredDispatch, DispatchChannel, IdentityProvider, Notifier, TracingNotifier,
};
pub use coordinator::{
	AdmissionRule, AdmissionSample, Coordinator, LoadCeiling, MaxProcesses, MemoryCeiling,
	ProcessSpawner, TickReport, WorkerSpawner,
};
pub use dispatcher::{EnqueueOptions, LaneDispatcher, NextJob};
pub use error::{JobsError, Result};
pub use health::{HealthMonitor, HealthReport, HealthState};
pub use pool::{create_pool, create_pool_with, migrate, PoolSettings};
pub use resources::{BudgetBreach, ResourceProbe, RunBudget, SysinfoProbe, SystemLoad};
pub use retry::{backoff_delay, backoff_window, GiveUpReason, RetryDecision, RetryPolicy};
pub use runner::{Claim, JobRunner, RunOutcome};
pub use scheduler::LaneScheduler;
pub use service::{JobService, JobServiceBuilder, LaneDrain, LaneRun, PendingJob};
pub use settings::EngineSettings;
pub use sqlite::SqliteDescriptorStore;
pub use store::{Checkpoint, CreateOutcome, DescriptorFilter, DescriptorStore};
