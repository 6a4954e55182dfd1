// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Memory, time and host-load sampling.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::System;

/// Host-wide load used by the coordinator's admission rules.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemLoad {
	pub memory_used_percent: f64,
	/// One-minute load average divided by the number of CPUs.
	pub load_per_cpu: f64,
}

pub trait ResourceProbe: Send + Sync {
	/// Resident memory of the current process, if it can be read.
	fn process_memory_bytes(&self) -> Option<u64>;

	fn system_load(&self) -> SystemLoad;
}

pub struct SysinfoProbe {
	system: Mutex<System>,
}

impl SysinfoProbe {
	pub fn new() -> Self {
		Self {
			system: Mutex::new(System::new()),
		}
	}
}

impl Default for SysinfoProbe {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for SysinfoProbe {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SysinfoProbe").finish_non_exhaustive()
	}
}

impl ResourceProbe for SysinfoProbe {
	fn process_memory_bytes(&self) -> Option<u64> {
		let pid = sysinfo::get_current_pid().ok()?;
		let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
		if !system.refresh_process(pid) {
			return None;
		}
		system.process(pid).map(|process| process.memory())
	}

	fn system_load(&self) -> SystemLoad {
		let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
		system.refresh_memory();

		let total = system.total_memory();
		let memory_used_percent = if total == 0 {
			0.0
		} else {
			system.used_memory() as f64 * 100.0 / total as f64
		};
		let cpus = std::thread::available_parallelism()
			.map(|n| n.get())
			.unwrap_or(1);

		SystemLoad {
			memory_used_percent,
			load_per_cpu: System::load_average().one / cpus as f64,
		}
	}
}

/// Why a run suspended itself back to Waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetBreach {
	Memory { used_bytes: u64, limit_bytes: u64 },
	Time { elapsed: Duration, limit: Duration },
}

impl fmt::Display for BudgetBreach {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Memory {
				used_bytes,
				limit_bytes,
			} => write!(
				f,
				"memory {} MiB over limit {} MiB",
				used_bytes / 1024 / 1024,
				limit_bytes / 1024 / 1024
			),
			Self::Time { elapsed, limit } => write!(
				f,
				"run time {}s over limit {}s",
				elapsed.as_secs(),
				limit.as_secs()
			),
		}
	}
}

/// Soft limits for one claim. Checked between steps, never mid-step.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
	started: Instant,
	memory_limit_bytes: Option<u64>,
	time_limit: Option<Duration>,
}

impl RunBudget {
	pub fn start(memory_limit_bytes: Option<u64>, time_limit: Option<Duration>) -> Self {
		Self {
			started: Instant::now(),
			memory_limit_bytes,
			time_limit,
		}
	}

	pub fn check(&self, probe: &dyn ResourceProbe) -> Option<BudgetBreach> {
		let used = match self.memory_limit_bytes {
			Some(_) => probe.process_memory_bytes(),
			None => None,
		};
		self.evaluate(used, self.started.elapsed())
	}

	fn evaluate(&self, used_bytes: Option<u64>, elapsed: Duration) -> Option<BudgetBreach> {
		if let (Some(limit_bytes), Some(used_bytes)) = (self.memory_limit_bytes, used_bytes) {
			if used_bytes > limit_bytes {
				return Some(BudgetBreach::Memory {
					used_bytes,
					limit_bytes,
				});
			}
		}
		match self.time_limit {
			Some(limit) if elapsed > limit => Some(BudgetBreach::Time { elapsed, limit }),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_memory_checked_before_time() {
		let budget = RunBudget::start(Some(100), Some(Duration::from_secs(1)));
		assert_eq!(
			budget.evaluate(Some(200), Duration::from_secs(5)),
			Some(BudgetBreach::Memory {
				used_bytes: 200,
				limit_bytes: 100
			})
		);
		assert!(matches!(
			budget.evaluate(Some(50), Duration::from_secs(5)),
			Some(BudgetBreach::Time { .. })
		));
		assert_eq!(budget.evaluate(Some(100), Duration::from_secs(1)), None);
	}

	#[test]
	fn test_unknown_memory_never_breaches() {
		let budget = RunBudget::start(Some(1), None);
		assert_eq!(budget.evaluate(None, Duration::from_secs(3600)), None);
	}

	#[test]
	fn test_sysinfo_probe_reads_current_process() {
		let probe = SysinfoProbe::new();
		if let Some(bytes) = probe.process_memory_bytes() {
			assert!(bytes > 0);
		}
		let load = probe.system_load();
		assert!((0.0..=100.0).contains(&load.memory_used_percent));
		assert!(load.load_per_cpu >= 0.0);
	}

	#[test]
	fn test_breach_display() {
		let breach = BudgetBreach::Memory {
			used_bytes: 300 * 1024 * 1024,
			limit_bytes: 256 * 1024 * 1024,
		};
		assert_eq!(breach.to_string(), "memory 300 MiB over limit 256 MiB");
	}
}
