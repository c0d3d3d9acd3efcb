//! Workspace orchestration business logic
//!
//! This crate holds the workspace controller, the shared per-namespace state
//! records and the idle tracker. It is consumed by the ws-api HTTP service and
//! the ws-port-exposer sidecar.

pub mod cluster;
pub mod controller;
pub mod error;
pub mod naming;
pub mod resources;
pub mod status;
pub mod store;
pub mod usage;
pub mod workspace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cluster::{ClusterApi, ClusterError, KubeCluster, Manifest};
pub use controller::{ControllerConfig, WorkspaceController};
pub use error::{OrchestratorError, Result};
pub use status::{LogOptions, WorkspaceLogs, WorkspaceStatus};
pub use store::{DescriptorRecord, StateStore, UsageRecord, UsageStatus};
pub use usage::{HttpHealthProbe, ScanReport, ScanSummary, TrackerConfig, UsageTracker};
pub use workspace::{CreateWorkspaceRequest, CreatedWorkspace, WorkspaceState, WorkspaceView};
