// SPDX-License-Identifier: MIT OR Apache-2.0
//! opsplane
//!
//! Facade over the workspace crates. The control plane itself ships as the
//! `opsplane` binary in `osp-server`; this crate re-exports the pieces so
//! embedders and the integration suite reach everything through one name.
#![deny(unsafe_code)]

pub use osp_artifact as artifact;
pub use osp_capability as capability;
pub use osp_context as context;
pub use osp_error as error;
pub use osp_executor as executor;
pub use osp_intent as intent;
pub use osp_paths as paths;
pub use osp_policy as policy;
pub use osp_protocol as protocol;
pub use osp_runbook as runbook;
pub use osp_runner as runner;
pub use osp_secure as secure;
pub use osp_server as server;
pub use osp_store as store;
pub use osp_template as template;
