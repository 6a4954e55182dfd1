// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process lane polling: one loop per lane plus the health sweep.

use std::sync::Arc;
use std::time::Duration;

use keel_jobs_core::Lane;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::service::JobService;

pub struct LaneScheduler {
	service: Arc<JobService>,
	poll_interval: Duration,
	health_interval: Duration,
	shutdown_tx: broadcast::Sender<()>,
	handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LaneScheduler {
	pub fn new(service: Arc<JobService>, poll_interval: Duration, health_interval: Duration) -> Self {
		let (shutdown_tx, _) = broadcast::channel(1);
		Self {
			service,
			poll_interval,
			health_interval,
			shutdown_tx,
			handles: Mutex::new(Vec::new()),
		}
	}

	#[instrument(skip(self))]
	pub async fn start(&self) {
		let mut handles = self.handles.lock().await;

		for lane in Lane::ALL {
			let service = Arc::clone(&self.service);
			let mut shutdown_rx = self.shutdown_tx.subscribe();
			let interval = self.poll_interval;

			handles.push(tokio::spawn(async move {
				loop {
					drain_lane(&service, lane).await;
					tokio::select! {
						_ = tokio::time::sleep(interval) => {}
						_ = shutdown_rx.recv() => {
							info!(lane = %lane, "Shutting down lane runner");
							break;
						}
					}
				}
			}));
		}

		let service = Arc::clone(&self.service);
		let mut shutdown_rx = self.shutdown_tx.subscribe();
		let interval = self.health_interval;
		handles.push(tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = tokio::time::sleep(interval) => {
						for lane in Lane::ALL {
							if let Err(e) = service.check_health(lane).await {
								warn!(lane = %lane, error = %e, "health sweep failed");
							}
						}
					}
					_ = shutdown_rx.recv() => {
						info!("Shutting down health monitor");
						break;
					}
				}
			}
		}));

		info!(tasks = handles.len(), "Lane scheduler started");
	}

	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		let _ = self.shutdown_tx.send(());

		let mut handles = self.handles.lock().await;
		for handle in handles.drain(..) {
			let _ = handle.await;
		}

		info!("Lane scheduler shut down");
	}
}

/// Run a lane batch and its Immediate-lane flush.
///
/// Shutdown is only observed between batches; a job always runs to its next
/// suspension point.
async fn drain_lane(service: &JobService, lane: Lane) {
	match service.drain_lane(lane).await {
		Ok(drain) => {
			for (id, outcome) in drain.ran.iter().chain(&drain.flushed) {
				if !outcome.is_success() {
					warn!(lane = %lane, descriptor_id = %id, outcome = ?outcome, "lane run unsuccessful");
				}
			}
		}
		Err(e) => warn!(lane = %lane, error = %e, "lane run failed"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dispatcher::EnqueueOptions;
	use crate::store::DescriptorStore;
	use crate::testing::{test_registry, test_store, FixedProbe, StepJob};
	use keel_jobs_core::JobStatus;

	#[tokio::test]
	async fn test_scheduler_drains_lanes_and_shuts_down() {
		let store: Arc<dyn DescriptorStore> = test_store().await;
		let service = Arc::new(
			JobService::builder(store.clone(), Arc::new(test_registry()))
				.probe(Arc::new(FixedProbe::default()))
				.build(),
		);
		let standard = service
			.enqueue(&StepJob::new("a", 2), EnqueueOptions::default())
			.await
			.unwrap();
		let large = service
			.enqueue(&StepJob::new("b", 2).in_lane(Lane::Large), EnqueueOptions::default())
			.await
			.unwrap();

		let scheduler = LaneScheduler::new(
			service.clone(),
			Duration::from_millis(10),
			Duration::from_secs(60),
		);
		scheduler.start().await;

		for _ in 0..200 {
			let a = store.get(standard).await.unwrap().unwrap().status;
			let b = store.get(large).await.unwrap().unwrap().status;
			if a == JobStatus::Complete && b == JobStatus::Complete {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		scheduler.shutdown().await;

		assert_eq!(store.get(standard).await.unwrap().unwrap().status, JobStatus::Complete);
		assert_eq!(store.get(large).await.unwrap().unwrap().status, JobStatus::Complete);
	}
}
