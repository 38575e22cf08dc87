//! Aggregate health classification for one poll's snapshot.
//!
//! Exactly one state comes out of every poll. Specific classifications win
//! over generic ones: a pod that is both Pending and resource-starved is
//! always `ResourceStarved`, never plain `Pending`.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::workload::{PodPhase, WorkloadSnapshot};

lazy_static! {
    /// Scheduler messages for pods that cannot fit on any node.
    static ref INSUFFICIENT_RESOURCES: Regex =
        Regex::new(r"Insufficient (cpu|memory)").expect("static regex");
    /// Waiting-container reasons in the image-pull-failure class.
    static ref IMAGE_PULL_FAILURE: Regex =
        Regex::new(r"ErrImagePull|ImagePullBackOff|InvalidImageName|ErrImageNeverPull")
            .expect("static regex");
}

/// Aggregate workload state for a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthState {
    /// Every pod Running and ready, observed count covers desired replicas.
    Healthy,
    /// At least one Pending pod is unschedulable for CPU/memory reasons.
    ResourceStarved,
    /// At least one pod cannot pull its image.
    ImageError,
    /// At least one pod is Pending without a more specific signal.
    Pending,
    /// Pods exist but are not fully healthy, or replicas have not been
    /// created yet. The catch-all non-terminal state.
    Degraded,
    /// Zero pods exist and none will be created.
    Failed,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::ResourceStarved => "resource-starved",
            Self::ImageError => "image-error",
            Self::Pending => "pending",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }

    /// Terminal states end a reconciliation run immediately.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Healthy | Self::Failed)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify one snapshot into its aggregate state.
pub fn classify(snapshot: &WorkloadSnapshot) -> HealthState {
    if snapshot.pods.is_empty() {
        // Nothing observed: failed if nothing will ever be created,
        // otherwise the orchestrator is still working on it.
        if snapshot.workloads.is_empty() || snapshot.desired_replicas() == 0 {
            return HealthState::Failed;
        }
        return HealthState::Degraded;
    }

    let all_running_ready = snapshot
        .pods
        .iter()
        .all(|p| p.phase == PodPhase::Running && p.ready);
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    if all_running_ready && snapshot.pods.len() as i32 >= snapshot.desired_replicas() {
        return HealthState::Healthy;
    }

    if snapshot.pods.iter().any(|p| {
        p.phase == PodPhase::Pending
            && p.reason
                .as_deref()
                .is_some_and(|r| INSUFFICIENT_RESOURCES.is_match(r))
    }) {
        return HealthState::ResourceStarved;
    }

    if snapshot
        .pods
        .iter()
        .any(|p| p.reason.as_deref().is_some_and(|r| IMAGE_PULL_FAILURE.is_match(r)))
    {
        return HealthState::ImageError;
    }

    if snapshot.pods.iter().any(|p| p.phase == PodPhase::Pending) {
        return HealthState::Pending;
    }

    HealthState::Degraded
}
