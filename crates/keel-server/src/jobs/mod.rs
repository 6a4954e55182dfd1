// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Built-in maintenance jobs.

mod descriptor_purge;

pub use descriptor_purge::{DescriptorPurgeJob, PurgeState, IMPLEMENTATION as DESCRIPTOR_PURGE};
