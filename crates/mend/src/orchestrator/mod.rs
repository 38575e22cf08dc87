//! The orchestrator API seam.
//!
//! The reconciler only ever talks to the cluster through this trait, so
//! the loop is testable without one. The kube-rs implementation lives in
//! [`kube::KubeOrchestrator`].

pub mod kube;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::workload::{PodObservation, ResourceSpec, WorkloadInfo};

pub use self::kube::KubeOrchestrator;

/// Service exposure types the reconciler can flip between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Exposure {
    ClusterIp,
    NodePort,
}

impl Exposure {
    /// The orchestrator's wire name for this exposure type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClusterIp => "ClusterIP",
            Self::NodePort => "NodePort",
        }
    }
}

/// Which pods a delete call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodFilter {
    /// Every pod whose phase is not Running.
    NonRunning,
    /// Every pod that is not Running and ready.
    NotReady,
    /// Every matching pod.
    All,
}

/// Minimal orchestrator surface the reconciler needs.
///
/// Implementations resolve credentials the way their client library does
/// (kubeconfig, in-cluster service account); nothing is reinvented here.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Fetch a fresh observation of every pod matching the selector.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodObservation>, CallError>;

    /// Fetch the deployment objects matching the selector, with their
    /// desired replica counts and declared resources.
    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<WorkloadInfo>, CallError>;

    /// Patch the named workload's pod template resources.
    async fn patch_workload_resources(
        &self,
        namespace: &str,
        name: &str,
        resources: &ResourceSpec,
    ) -> Result<(), CallError>;

    /// Delete pods matching the selector and filter so the orchestrator
    /// recreates them. Returns how many were deleted.
    async fn delete_pods(
        &self,
        namespace: &str,
        selector: &str,
        filter: PodFilter,
    ) -> Result<u32, CallError>;

    /// Flip the named Service's exposure type.
    async fn patch_service_exposure(
        &self,
        namespace: &str,
        name: &str,
        exposure: Exposure,
    ) -> Result<(), CallError>;
}
