// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-store
#![deny(unsafe_code)]

pub mod audit;
pub mod jobs;
pub mod profile;
pub mod registry;
pub mod state;

pub use audit::{AuditEntry, AuditFilter, AuditLog, AuditStatus};
pub use jobs::{JobPatch, JobRecord, JobStatus, JobStore};
pub use profile::{Profile, ProfileStore, ProfileUpdate, ProfileView, SecretsUpdate};
pub use registry::{NamedStore, Project, ProjectTarget};
pub use state::{LockState, Scope, StateStore};
