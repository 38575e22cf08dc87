//! The reconciliation loop: poll, classify, remediate, re-poll.
//!
//! Single task, synchronous polls, suspension only at the configured
//! interval between attempts. The orchestrator's own controllers mutate
//! the workload concurrently; the loop tolerates observing states it did
//! not cause and never assumes its last action explains the next poll.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::{classify, HealthState};
use crate::error::{CallError, ReconcileError};
use crate::orchestrator::{Exposure, Orchestrator, PodFilter};
use crate::policy::{Policy, RemediationAction};
use crate::rebuild::Rebuilder;
use crate::workload::{WorkloadRef, WorkloadSnapshot};

/// Terminal result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalState {
    /// The workload reached full health.
    Healthy,
    /// Attempts (or the deadline) ran out while pods still existed.
    Degraded,
    /// Nothing was ever going to be created.
    Failed,
}

impl FinalState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

/// What happened when a recorded action was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionOutcome {
    Applied { detail: String },
    Failed { error: String },
}

/// One entry in the run's remediation log.
///
/// Appended before its action is applied, so a crash mid-remediation
/// still leaves an accurate partial log: `outcome` stays `None` and
/// `state_after` is filled by the next poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRecord {
    pub at: DateTime<Utc>,
    pub attempt: u32,
    pub action: RemediationAction,
    pub state_before: HealthState,
    pub state_after: Option<HealthState>,
    pub outcome: Option<ActionOutcome>,
}

/// Result of a reconciliation run, always renderable - including on
/// `Degraded` and `Failed`, so a human can see exactly what was tried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub run_id: Uuid,
    pub workload: WorkloadRef,
    pub final_state: FinalState,
    pub attempts_used: u32,
    pub records: Vec<RemediationRecord>,
}

/// Knobs for a single run.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Upper bound on polls; the loop performs at most this many.
    pub max_attempts: u32,
    /// Sleep between attempts.
    pub poll_interval: Duration,
    /// Optional wall-clock budget for the whole run.
    pub deadline: Option<Duration>,
    /// Image reference handed to the rebuild hook.
    pub image: Option<String>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            poll_interval: Duration::from_secs(10),
            deadline: None,
            image: None,
        }
    }
}

/// Drives a workload toward health, or gives up after a bounded number of
/// attempts, applying only the actions its policy declares.
pub struct Reconciler<'a> {
    orchestrator: &'a dyn Orchestrator,
    rebuilder: Option<&'a dyn Rebuilder>,
    policy: Policy,
    options: ReconcileOptions,
}

impl<'a> Reconciler<'a> {
    pub fn new(orchestrator: &'a dyn Orchestrator, policy: Policy, options: ReconcileOptions) -> Self {
        Self {
            orchestrator,
            rebuilder: None,
            policy,
            options,
        }
    }

    pub fn with_rebuilder(mut self, rebuilder: &'a dyn Rebuilder) -> Self {
        self.rebuilder = Some(rebuilder);
        self
    }

    /// Run the loop until the workload is healthy, the workload is gone,
    /// or the attempt budget is exhausted.
    pub async fn run(&self, workload: &WorkloadRef) -> Result<ReconcileOutcome, ReconcileError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut records: Vec<RemediationRecord> = Vec::new();
        let mut attempts_used = 0;
        let mut final_state = FinalState::Degraded;

        info!(
            run_id = %run_id,
            namespace = %workload.namespace,
            selector = %workload.selector,
            max_attempts = self.options.max_attempts,
            "Starting reconciliation run"
        );

        for attempt in 1..=self.options.max_attempts {
            attempts_used = attempt;

            let snapshot = match self.poll(workload).await {
                Ok(snapshot) => snapshot,
                Err(err) if err.is_connectivity() => {
                    // Nothing in the action vocabulary fixes connectivity.
                    return Err(ReconcileError::BackendUnavailable {
                        detail: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(run_id = %run_id, attempt, error = %err, "Poll failed; retrying on the next attempt");
                    if self.pause(attempt, started).await {
                        continue;
                    }
                    break;
                }
            };

            if attempt == 1 && snapshot.pods.is_empty() && snapshot.workloads.is_empty() {
                return Err(ReconcileError::WorkloadNotFound {
                    namespace: workload.namespace.clone(),
                    selector: workload.selector.clone(),
                });
            }

            let state = classify(&snapshot);
            close_out_previous(&mut records, state, run_id);
            info!(
                run_id = %run_id,
                attempt,
                state = %state,
                pods = snapshot.pods.len(),
                desired = snapshot.desired_replicas(),
                "Observed workload state"
            );

            if state == HealthState::Healthy {
                final_state = FinalState::Healthy;
                break;
            }
            if state == HealthState::Failed {
                final_state = FinalState::Failed;
                break;
            }

            let reduce_exhausted = self.reduce_exhausted(&snapshot);
            if let Some(action) = self.policy.select(state, reduce_exhausted) {
                let action = action.clone();
                // Record first, then apply: a crash between the two still
                // leaves the log accurate.
                records.push(RemediationRecord {
                    at: Utc::now(),
                    attempt,
                    action: action.clone(),
                    state_before: state,
                    state_after: None,
                    outcome: None,
                });
                let outcome = self.apply(workload, &snapshot, &action, run_id).await;
                if let Some(record) = records.last_mut() {
                    record.outcome = Some(outcome);
                }
            } else {
                debug!(
                    run_id = %run_id,
                    state = %state,
                    "No policy rule matches; leaving this one to the orchestrator"
                );
            }

            if !self.pause(attempt, started).await {
                break;
            }
        }

        info!(
            run_id = %run_id,
            final_state = final_state.as_str(),
            attempts_used,
            remediations = records.len(),
            "Reconciliation run finished"
        );

        Ok(ReconcileOutcome {
            run_id,
            workload: workload.clone(),
            final_state,
            attempts_used,
            records,
        })
    }

    /// One consistent snapshot: pods first, then the owning deployments.
    async fn poll(&self, workload: &WorkloadRef) -> Result<WorkloadSnapshot, CallError> {
        let pods = self
            .orchestrator
            .list_pods(&workload.namespace, &workload.selector)
            .await?;
        let workloads = self
            .orchestrator
            .list_workloads(&workload.namespace, &workload.selector)
            .await?;
        Ok(WorkloadSnapshot { pods, workloads })
    }

    /// Sleep between attempts. Returns false when the budget is spent and
    /// the loop should stop instead.
    async fn pause(&self, attempt: u32, started: Instant) -> bool {
        if attempt >= self.options.max_attempts {
            return false;
        }
        if let Some(deadline) = self.options.deadline {
            if started.elapsed() >= deadline {
                warn!("Deadline exceeded; giving up with attempts remaining");
                return false;
            }
        }
        if !self.options.poll_interval.is_zero() {
            tokio::time::sleep(self.options.poll_interval).await;
        }
        true
    }

    /// True once every matching deployment's resources sit at the policy
    /// floor, making another reduce step a no-op.
    fn reduce_exhausted(&self, snapshot: &WorkloadSnapshot) -> bool {
        !snapshot.workloads.is_empty()
            && snapshot.workloads.iter().all(|w| {
                w.resources
                    .as_ref()
                    .is_some_and(|spec| self.policy.resources.at_floor(spec))
            })
    }

    async fn apply(
        &self,
        workload: &WorkloadRef,
        snapshot: &WorkloadSnapshot,
        action: &RemediationAction,
        run_id: Uuid,
    ) -> ActionOutcome {
        let result = match action {
            RemediationAction::ReduceResourceFootprint => {
                self.reduce_resources(workload, snapshot).await
            }
            RemediationAction::ForceReschedule => self.force_reschedule(workload).await,
            RemediationAction::RebuildAndReload => self.rebuild().await,
            RemediationAction::ExposeExternally { service } => self
                .orchestrator
                .patch_service_exposure(&workload.namespace, service, Exposure::NodePort)
                .await
                .map(|()| format!("service {service} exposed via NodePort")),
        };

        match result {
            Ok(detail) => {
                info!(run_id = %run_id, action = %action, detail = %detail, "Applied remediation");
                ActionOutcome::Applied { detail }
            }
            Err(err) => {
                // Transient: logged on the record, never aborts the run.
                warn!(run_id = %run_id, action = %action, error = %err, "Remediation call failed");
                ActionOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    async fn reduce_resources(
        &self,
        workload: &WorkloadRef,
        snapshot: &WorkloadSnapshot,
    ) -> Result<String, CallError> {
        let mut patched = Vec::new();
        for info in &snapshot.workloads {
            let current = info.resources.clone().unwrap_or_default();
            if self.policy.resources.at_floor(&current) {
                continue;
            }
            let target = self.policy.resources.reduce(&current);
            self.orchestrator
                .patch_workload_resources(&workload.namespace, &info.name, &target)
                .await?;
            patched.push(info.name.clone());
        }
        if patched.is_empty() {
            Ok("resource requests already at the configured floor".to_string())
        } else {
            Ok(format!("reduced resources on {}", patched.join(", ")))
        }
    }

    async fn force_reschedule(&self, workload: &WorkloadRef) -> Result<String, CallError> {
        let deleted = self
            .orchestrator
            .delete_pods(&workload.namespace, &workload.selector, PodFilter::NonRunning)
            .await?;
        Ok(format!("deleted {deleted} pod(s) for rescheduling"))
    }

    async fn rebuild(&self) -> Result<String, CallError> {
        let Some(rebuilder) = self.rebuilder else {
            return Err(CallError::Other(
                "no rebuild hook configured (--rebuild-cmd)".to_string(),
            ));
        };
        let Some(image) = self.options.image.as_deref() else {
            return Err(CallError::Other(
                "no image reference configured (--image)".to_string(),
            ));
        };
        rebuilder.rebuild_and_publish(image).await?;
        Ok(format!("rebuilt and republished {image}"))
    }
}

/// Fill `state_after` on the newest record once the next poll lands, and
/// note when the action visibly changed nothing.
fn close_out_previous(records: &mut [RemediationRecord], state: HealthState, run_id: Uuid) {
    if let Some(record) = records.last_mut() {
        if record.state_after.is_none() {
            record.state_after = Some(state);
            if state == record.state_before {
                info!(
                    run_id = %run_id,
                    action = %record.action,
                    state = %state,
                    "Remediation ineffective: state unchanged since last poll"
                );
            }
        }
    }
}
