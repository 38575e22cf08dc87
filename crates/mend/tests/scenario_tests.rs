//! End-to-end reconciliation scenarios over a scripted orchestrator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mend::{
    CallError, Exposure, FinalState, HealthState, Orchestrator, PodFilter, PodObservation,
    PodPhase, Policy, PolicyRule, ReconcileError, ReconcileOptions, Reconciler, RemediationAction,
    ResourceSpec, WorkloadInfo, WorkloadRef,
};

/// One scripted poll's worth of cluster state.
#[derive(Clone, Default)]
struct ClusterState {
    pods: Vec<PodObservation>,
    workloads: Vec<WorkloadInfo>,
}

/// Replays a fixed sequence of cluster states, one per poll, repeating the
/// last state once the script runs out. Counts every mutating call.
struct ScriptedOrchestrator {
    states: Vec<ClusterState>,
    cursor: AtomicUsize,
    unreachable: bool,
    patches: AtomicUsize,
    deletions: AtomicUsize,
    exposures: AtomicUsize,
    patched_specs: Mutex<Vec<ResourceSpec>>,
}

impl ScriptedOrchestrator {
    fn new(states: Vec<ClusterState>) -> Self {
        Self {
            states,
            cursor: AtomicUsize::new(0),
            unreachable: false,
            patches: AtomicUsize::new(0),
            deletions: AtomicUsize::new(0),
            exposures: AtomicUsize::new(0),
            patched_specs: Mutex::new(Vec::new()),
        }
    }

    fn unreachable() -> Self {
        let mut scripted = Self::new(vec![ClusterState::default()]);
        scripted.unreachable = true;
        scripted
    }

    fn current(&self) -> ClusterState {
        let polled = self.cursor.load(Ordering::SeqCst);
        let index = polled.saturating_sub(1).min(self.states.len() - 1);
        self.states[index].clone()
    }
}

#[async_trait]
impl Orchestrator for ScriptedOrchestrator {
    async fn list_pods(
        &self,
        _namespace: &str,
        _selector: &str,
    ) -> Result<Vec<PodObservation>, CallError> {
        if self.unreachable {
            return Err(CallError::Unreachable("connection refused".to_string()));
        }
        // Advancing here keeps the paired list_workloads call on the same
        // scripted state: the reconciler polls pods first.
        self.cursor.fetch_add(1, Ordering::SeqCst);
        Ok(self.current().pods)
    }

    async fn list_workloads(
        &self,
        _namespace: &str,
        _selector: &str,
    ) -> Result<Vec<WorkloadInfo>, CallError> {
        Ok(self.current().workloads)
    }

    async fn patch_workload_resources(
        &self,
        _namespace: &str,
        _name: &str,
        resources: &ResourceSpec,
    ) -> Result<(), CallError> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut specs) = self.patched_specs.lock() {
            specs.push(resources.clone());
        }
        Ok(())
    }

    async fn delete_pods(
        &self,
        _namespace: &str,
        _selector: &str,
        _filter: PodFilter,
    ) -> Result<u32, CallError> {
        self.deletions.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    async fn patch_service_exposure(
        &self,
        _namespace: &str,
        _name: &str,
        _exposure: Exposure,
    ) -> Result<(), CallError> {
        self.exposures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn running_pod(name: &str) -> PodObservation {
    PodObservation {
        name: name.to_string(),
        phase: PodPhase::Running,
        ready: true,
        restart_count: 0,
        reason: None,
    }
}

fn starved_pod(name: &str) -> PodObservation {
    PodObservation {
        name: name.to_string(),
        phase: PodPhase::Pending,
        ready: false,
        restart_count: 0,
        reason: Some("0/3 nodes are available: 3 Insufficient memory.".to_string()),
    }
}

fn deployment(desired: i32, resources: Option<ResourceSpec>) -> WorkloadInfo {
    WorkloadInfo {
        name: "flask-app".to_string(),
        desired_replicas: desired,
        resources,
    }
}

fn fast_options(max_attempts: u32) -> ReconcileOptions {
    ReconcileOptions {
        max_attempts,
        poll_interval: Duration::ZERO,
        deadline: None,
        image: None,
    }
}

fn workload_ref() -> WorkloadRef {
    WorkloadRef::new("demo", "app=flask-app")
}

/// Scenario A: one replica stuck Pending on "Insufficient memory". The
/// first attempt reduces the resource footprint; the second poll sees the
/// pod running and the run ends healthy.
#[tokio::test]
async fn starved_workload_recovers_after_resource_reduction() {
    let generous = ResourceSpec {
        cpu_request_millis: Some(500),
        memory_request_mebibytes: Some(1024),
        cpu_limit_millis: Some(1000),
        memory_limit_mebibytes: Some(2048),
    };
    let orchestrator = ScriptedOrchestrator::new(vec![
        ClusterState {
            pods: vec![starved_pod("flask-app-7d4b9-x2x")],
            workloads: vec![deployment(1, Some(generous))],
        },
        ClusterState {
            pods: vec![running_pod("flask-app-7d4b9-x2x")],
            workloads: vec![deployment(1, None)],
        },
    ]);

    let reconciler = Reconciler::new(&orchestrator, Policy::default_policy(), fast_options(10));
    let outcome = reconciler.run(&workload_ref()).await.expect("run succeeds");

    assert_eq!(outcome.final_state, FinalState::Healthy);
    assert_eq!(outcome.attempts_used, 2);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(
        outcome.records[0].action,
        RemediationAction::ReduceResourceFootprint
    );
    assert_eq!(orchestrator.patches.load(Ordering::SeqCst), 1);

    // The one patch halves everything toward the floor.
    let specs = orchestrator.patched_specs.lock().expect("no poisoned lock");
    assert_eq!(specs[0].cpu_request_millis, Some(250));
    assert_eq!(specs[0].memory_request_mebibytes, Some(512));
}

/// Scenario B: a deployment wants one replica but no pod ever appears and
/// no policy rule matches the resulting state. The run burns its attempts
/// and gives up Degraded with an empty log.
#[tokio::test]
async fn no_matching_rule_exhausts_attempts_quietly() {
    let orchestrator = ScriptedOrchestrator::new(vec![ClusterState {
        pods: vec![],
        workloads: vec![deployment(1, None)],
    }]);

    let reconciler = Reconciler::new(&orchestrator, Policy::default_policy(), fast_options(3));
    let outcome = reconciler.run(&workload_ref()).await.expect("run completes");

    assert_eq!(outcome.final_state, FinalState::Degraded);
    assert_eq!(outcome.attempts_used, 3);
    assert!(outcome.records.is_empty());
    assert_eq!(orchestrator.patches.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.deletions.load(Ordering::SeqCst), 0);
}

/// Scenario C: the API is unreachable on the very first poll. The run
/// fails immediately - no remediations, no sleeping through the interval.
#[tokio::test]
async fn unreachable_backend_fails_fast() {
    let orchestrator = ScriptedOrchestrator::unreachable();

    let options = ReconcileOptions {
        max_attempts: 5,
        poll_interval: Duration::from_secs(30),
        deadline: None,
        image: None,
    };
    let reconciler = Reconciler::new(&orchestrator, Policy::default_policy(), options);

    let started = Instant::now();
    let err = reconciler
        .run(&workload_ref())
        .await
        .expect_err("backend is down");

    assert!(matches!(err, ReconcileError::BackendUnavailable { .. }));
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// Scenario D: a healthy workload whose Service is still cluster-internal.
/// Exposure only ever fires from policy rules tied to pod classification,
/// so the run ends healthy without touching the Service.
#[tokio::test]
async fn healthy_workload_never_triggers_exposure() {
    let orchestrator = ScriptedOrchestrator::new(vec![ClusterState {
        pods: vec![running_pod("flask-app-7d4b9-x2x")],
        workloads: vec![deployment(1, None)],
    }]);

    let mut policy = Policy::default_policy();
    policy.rules.push(PolicyRule {
        on: HealthState::Degraded,
        action: RemediationAction::ExposeExternally {
            service: "flask-app".to_string(),
        },
    });

    let reconciler = Reconciler::new(&orchestrator, policy, fast_options(5));
    let outcome = reconciler.run(&workload_ref()).await.expect("run succeeds");

    assert_eq!(outcome.final_state, FinalState::Healthy);
    assert_eq!(outcome.attempts_used, 1);
    assert!(outcome.records.is_empty());
    assert_eq!(orchestrator.exposures.load(Ordering::SeqCst), 0);
}

/// A degraded workload with an exposure rule does flip its Service.
#[tokio::test]
async fn degraded_workload_exposes_its_service() {
    let orchestrator = ScriptedOrchestrator::new(vec![
        ClusterState {
            pods: vec![
                running_pod("flask-app-7d4b9-x2x"),
                PodObservation {
                    name: "flask-app-7d4b9-y3y".to_string(),
                    phase: PodPhase::Running,
                    ready: false,
                    restart_count: 1,
                    reason: None,
                },
            ],
            workloads: vec![deployment(2, None)],
        },
        ClusterState {
            pods: vec![
                running_pod("flask-app-7d4b9-x2x"),
                running_pod("flask-app-7d4b9-y3y"),
            ],
            workloads: vec![deployment(2, None)],
        },
    ]);

    let policy = Policy {
        rules: vec![PolicyRule {
            on: HealthState::Degraded,
            action: RemediationAction::ExposeExternally {
                service: "flask-app".to_string(),
            },
        }],
        ..Policy::default_policy()
    };

    let reconciler = Reconciler::new(&orchestrator, policy, fast_options(5));
    let outcome = reconciler.run(&workload_ref()).await.expect("run succeeds");

    assert_eq!(outcome.final_state, FinalState::Healthy);
    assert_eq!(orchestrator.exposures.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(
        outcome.records[0].state_after,
        Some(HealthState::Healthy)
    );
}

/// Repeated reduction converges to the floor and then stops patching.
#[tokio::test]
async fn reduction_converges_and_stops_at_the_floor() {
    let floor = ResourceSpec {
        cpu_request_millis: Some(25),
        memory_request_mebibytes: Some(32),
        cpu_limit_millis: Some(100),
        memory_limit_mebibytes: Some(128),
    };
    let orchestrator = ScriptedOrchestrator::new(vec![
        ClusterState {
            pods: vec![starved_pod("flask-app-7d4b9-x2x")],
            workloads: vec![deployment(
                1,
                Some(ResourceSpec {
                    cpu_request_millis: Some(50),
                    memory_request_mebibytes: Some(64),
                    cpu_limit_millis: Some(200),
                    memory_limit_mebibytes: Some(256),
                }),
            )],
        },
        // The patch landed but the pod is still starved: resources now
        // sit at the floor, so the next attempt falls through to a
        // reschedule instead of repeating the patch.
        ClusterState {
            pods: vec![starved_pod("flask-app-7d4b9-x2x")],
            workloads: vec![deployment(1, Some(floor))],
        },
    ]);

    let reconciler = Reconciler::new(&orchestrator, Policy::default_policy(), fast_options(3));
    let outcome = reconciler.run(&workload_ref()).await.expect("run completes");

    assert_eq!(orchestrator.patches.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.deletions.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.attempts_used, 3);
    assert_eq!(outcome.records.len(), 3);
    assert_eq!(
        outcome.records[0].action,
        RemediationAction::ReduceResourceFootprint
    );
    assert_eq!(outcome.records[1].action, RemediationAction::ForceReschedule);
    assert_eq!(outcome.records[2].action, RemediationAction::ForceReschedule);
}

/// A vanished workload (zero pods, zero deployments) on the first poll is
/// fatal rather than silently looping.
#[tokio::test]
async fn vanished_workload_is_reported() {
    let orchestrator = ScriptedOrchestrator::new(vec![ClusterState::default()]);

    let reconciler = Reconciler::new(&orchestrator, Policy::default_policy(), fast_options(5));
    let err = reconciler
        .run(&workload_ref())
        .await
        .expect_err("nothing matches");

    let message = err.to_string();
    assert!(matches!(err, ReconcileError::WorkloadNotFound { .. }));
    assert!(message.contains("app=flask-app"));
    assert!(message.contains("demo"));
}
