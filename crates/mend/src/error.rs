//! Error taxonomy for orchestrator calls and reconciliation runs.

use thiserror::Error;

/// Failure of a single orchestrator call.
///
/// Connectivity loss is the one class no remediation can fix; everything
/// else is transient from the loop's point of view.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The orchestrator API cannot be reached at all.
    #[error("orchestrator API unreachable: {0}")]
    Unreachable(String),

    /// The orchestrator rejected the call.
    #[error("orchestrator rejected the call (HTTP {code}): {message}")]
    Api { code: u16, message: String },

    /// Anything else that went wrong issuing the call.
    #[error("{0}")]
    Other(String),
}

impl CallError {
    /// True when the error means the backend itself is gone, not that a
    /// particular call was rejected.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Fatal errors that abort a reconciliation run.
///
/// Everything not covered here is swallowed into the remediation log as a
/// transient outcome and the run continues.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The orchestrator API cannot be reached; no remediation can fix
    /// connectivity, so the run short-circuits.
    #[error("orchestrator API unavailable: {detail}")]
    BackendUnavailable { detail: String },

    /// The workload reference resolved to zero pods and zero deployment
    /// objects on the first poll.
    #[error("no pods or deployments match selector '{selector}' in namespace '{namespace}'")]
    WorkloadNotFound { namespace: String, selector: String },
}
