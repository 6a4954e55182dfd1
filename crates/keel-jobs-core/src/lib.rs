// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Keel job engine.
//!
//! This crate holds everything a job payload needs to know about: the [`Job`]
//! contract, the [`JobProgress`] counters a job advances while it works, the
//! persisted [`JobDescriptor`] record and the [`JobRegistry`] used to rebuild a
//! job from its descriptor after a restart.

pub mod descriptor;
pub mod error;
pub mod job;
pub mod message;
pub mod progress;
pub mod registry;

pub use descriptor::{DescriptorId, JobDescriptor, JobStatus, Lane, NewDescriptor};
pub use error::{JobError, Result};
pub use job::{compute_signature, from_state, to_state, Job};
pub use message::{JobMessage, Severity};
pub use progress::JobProgress;
pub use registry::JobRegistry;
