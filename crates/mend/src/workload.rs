//! Workload identity and per-poll observations.

use serde::{Deserialize, Serialize};

/// Identifies the workload a reconciliation run operates on.
///
/// Immutable for the lifetime of a run; every poll resolves the same
/// namespace + label selector pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub selector: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            selector: selector.into(),
        }
    }
}

/// Pod phase as reported by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

/// Snapshot of a single pod, produced fresh on every poll.
///
/// `reason` carries the scheduler's unschedulable message (e.g.
/// "0/3 nodes are available: 3 Insufficient memory.") or a waiting
/// container's reason (e.g. "ImagePullBackOff"), whichever is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodObservation {
    pub name: String,
    pub phase: PodPhase,
    pub ready: bool,
    pub restart_count: i32,
    pub reason: Option<String>,
}

/// Snapshot of a deployment-like object matching the selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub name: String,
    pub desired_replicas: i32,
    pub resources: Option<ResourceSpec>,
}

/// One poll's consistent view of the workload: its pods and the
/// deployment objects that own them. Never mixes observations from
/// different polls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    pub pods: Vec<PodObservation>,
    pub workloads: Vec<WorkloadInfo>,
}

impl WorkloadSnapshot {
    /// Total replicas the matching deployments ask for.
    pub fn desired_replicas(&self) -> i32 {
        self.workloads.iter().map(|w| w.desired_replicas).sum()
    }
}

/// CPU/memory request and limit quadruple from a workload's pod template,
/// normalized to millicores and mebibytes. Fields the template does not
/// declare stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_request_millis: Option<u64>,
    pub memory_request_mebibytes: Option<u64>,
    pub cpu_limit_millis: Option<u64>,
    pub memory_limit_mebibytes: Option<u64>,
}

impl ResourceSpec {
    pub fn is_empty(&self) -> bool {
        self.cpu_request_millis.is_none()
            && self.memory_request_mebibytes.is_none()
            && self.cpu_limit_millis.is_none()
            && self.memory_limit_mebibytes.is_none()
    }
}

/// Parse a Kubernetes CPU quantity ("250m", "1", "0.5") into millicores.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_cpu_millis(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    if let Some(millis) = quantity.strip_suffix('m') {
        return millis.parse().ok();
    }
    let cores: f64 = quantity.parse().ok()?;
    if !cores.is_finite() || cores < 0.0 {
        return None;
    }
    Some((cores * 1000.0).round() as u64)
}

/// Parse a Kubernetes memory quantity ("64Mi", "1Gi", "128M", plain bytes)
/// into mebibytes, rounding down.
pub fn parse_memory_mebibytes(quantity: &str) -> Option<u64> {
    const MI: u64 = 1024 * 1024;
    let quantity = quantity.trim();
    let (digits, bytes_per_unit) = if let Some(n) = quantity.strip_suffix("Ki") {
        (n, 1024)
    } else if let Some(n) = quantity.strip_suffix("Mi") {
        (n, MI)
    } else if let Some(n) = quantity.strip_suffix("Gi") {
        (n, 1024 * MI)
    } else if let Some(n) = quantity.strip_suffix("Ti") {
        (n, 1024 * 1024 * MI)
    } else if let Some(n) = quantity.strip_suffix('K') {
        (n, 1_000)
    } else if let Some(n) = quantity.strip_suffix('M') {
        (n, 1_000_000)
    } else if let Some(n) = quantity.strip_suffix('G') {
        (n, 1_000_000_000)
    } else {
        (quantity, 1)
    };
    let value: u64 = digits.parse().ok()?;
    Some(value.checked_mul(bytes_per_unit)? / MI)
}

/// Format millicores back into the "250m" quantity form.
pub fn format_cpu_millis(millis: u64) -> String {
    format!("{millis}m")
}

/// Format mebibytes back into the "64Mi" quantity form.
pub fn format_memory_mebibytes(mebibytes: u64) -> String {
    format!("{mebibytes}Mi")
}
