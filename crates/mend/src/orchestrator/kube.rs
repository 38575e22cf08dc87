//! kube-rs backed orchestrator client.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, warn};

use super::{Exposure, Orchestrator, PodFilter};
use crate::error::CallError;
use crate::workload::{
    format_cpu_millis, format_memory_mebibytes, parse_cpu_millis, parse_memory_mebibytes,
    PodObservation, PodPhase, ResourceSpec, WorkloadInfo,
};

/// Orchestrator implementation over the Kubernetes API.
///
/// Credentials and context resolve the way kube-rs resolves them:
/// kubeconfig on a workstation, the service account in-cluster.
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the ambient kubeconfig / in-cluster config.
    pub async fn connect() -> Result<Self, CallError> {
        let client = Client::try_default()
            .await
            .map_err(|e| CallError::Unreachable(e.to_string()))?;
        Ok(Self { client })
    }
}

fn map_kube_err(err: kube::Error) -> CallError {
    match err {
        kube::Error::Api(response) => CallError::Api {
            code: response.code,
            message: response.message,
        },
        kube::Error::HyperError(e) => CallError::Unreachable(e.to_string()),
        kube::Error::Service(e) => CallError::Unreachable(e.to_string()),
        other => CallError::Other(other.to_string()),
    }
}

/// Collapse a typed Pod into the observation the classifier consumes.
fn observe_pod(pod: Pod) -> PodObservation {
    let name = pod.metadata.name.unwrap_or_default();
    let status = pod.status.unwrap_or_default();
    let phase = status
        .phase
        .as_deref()
        .map_or(PodPhase::Unknown, PodPhase::parse);

    let conditions = status.conditions.unwrap_or_default();
    let ready = conditions
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");

    // Prefer the scheduler's message ("0/3 nodes are available: ...") over
    // a waiting container's reason; both feed the same classifier field.
    let mut reason = conditions
        .iter()
        .find(|c| c.type_ == "PodScheduled" && c.status == "False")
        .and_then(|c| c.message.clone().or_else(|| c.reason.clone()));

    let container_statuses = status.container_statuses.unwrap_or_default();
    let restart_count = container_statuses.iter().map(|c| c.restart_count).sum();
    if reason.is_none() {
        reason = container_statuses
            .iter()
            .find_map(|c| c.state.as_ref()?.waiting.as_ref()?.reason.clone());
    }

    PodObservation {
        name,
        phase,
        ready,
        restart_count,
        reason,
    }
}

fn quantity<'a>(
    map: Option<&'a std::collections::BTreeMap<String, Quantity>>,
    key: &str,
) -> Option<&'a str> {
    map.and_then(|m| m.get(key)).map(|q| q.0.as_str())
}

fn workload_info(deployment: Deployment) -> WorkloadInfo {
    let name = deployment.metadata.name.unwrap_or_default();
    let spec = deployment.spec.unwrap_or_default();
    // Kubernetes defaults an unset replica count to 1.
    let desired_replicas = spec.replicas.unwrap_or(1);
    let resources = spec
        .template
        .spec
        .as_ref()
        .and_then(|pod_spec| pod_spec.containers.first())
        .and_then(|container| container.resources.as_ref())
        .map(|requirements| ResourceSpec {
            cpu_request_millis: quantity(requirements.requests.as_ref(), "cpu")
                .and_then(parse_cpu_millis),
            memory_request_mebibytes: quantity(requirements.requests.as_ref(), "memory")
                .and_then(parse_memory_mebibytes),
            cpu_limit_millis: quantity(requirements.limits.as_ref(), "cpu")
                .and_then(parse_cpu_millis),
            memory_limit_mebibytes: quantity(requirements.limits.as_ref(), "memory")
                .and_then(parse_memory_mebibytes),
        })
        .filter(|spec| !spec.is_empty());

    WorkloadInfo {
        name,
        desired_replicas,
        resources,
    }
}

/// Build the requests/limits JSON for a strategic merge patch, emitting
/// only the declared fields.
fn resource_requirements_json(resources: &ResourceSpec) -> serde_json::Value {
    let quantities = |cpu_millis: Option<u64>, memory_mebibytes: Option<u64>| {
        let mut map = serde_json::Map::new();
        if let Some(millis) = cpu_millis {
            map.insert("cpu".to_string(), json!(format_cpu_millis(millis)));
        }
        if let Some(mebibytes) = memory_mebibytes {
            map.insert(
                "memory".to_string(),
                json!(format_memory_mebibytes(mebibytes)),
            );
        }
        serde_json::Value::Object(map)
    };
    json!({
        "requests": quantities(resources.cpu_request_millis, resources.memory_request_mebibytes),
        "limits": quantities(resources.cpu_limit_millis, resources.memory_limit_mebibytes),
    })
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodObservation>, CallError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        let list = pods.list(&lp).await.map_err(map_kube_err)?;
        Ok(list.items.into_iter().map(observe_pod).collect())
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<WorkloadInfo>, CallError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        let list = deployments.list(&lp).await.map_err(map_kube_err)?;
        Ok(list.items.into_iter().map(workload_info).collect())
    }

    async fn patch_workload_resources(
        &self,
        namespace: &str,
        name: &str,
        resources: &ResourceSpec,
    ) -> Result<(), CallError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);

        // Strategic merge on the containers list needs the merge key, so
        // read the current template for the container name first.
        let current = deployments.get(name).await.map_err(map_kube_err)?;
        let container_name = current
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|pod_spec| pod_spec.containers.first())
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                CallError::Other(format!("deployment {name} has no containers to patch"))
            })?;

        let patch = json!({
            "spec": {
                "template": {
                    "spec": {
                        "containers": [{
                            "name": container_name,
                            "resources": resource_requirements_json(resources),
                        }]
                    }
                }
            }
        });

        deployments
            .patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .map_err(map_kube_err)?;
        debug!(deployment = %name, "Patched workload resources");
        Ok(())
    }

    async fn delete_pods(
        &self,
        namespace: &str,
        selector: &str,
        filter: PodFilter,
    ) -> Result<u32, CallError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        let list = pods.list(&lp).await.map_err(map_kube_err)?;

        let mut deleted = 0u32;
        let mut last_failure: Option<CallError> = None;
        for pod in list.items {
            let observation = observe_pod(pod);
            let keep = match filter {
                PodFilter::NonRunning => observation.phase == PodPhase::Running,
                PodFilter::NotReady => observation.phase == PodPhase::Running && observation.ready,
                PodFilter::All => false,
            };
            if keep {
                continue;
            }
            match pods.delete(&observation.name, &DeleteParams::default()).await {
                Ok(_) => {
                    deleted += 1;
                    debug!(pod = %observation.name, "Deleted pod for rescheduling");
                }
                // Already gone; the orchestrator beat us to it.
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => {
                    warn!(pod = %observation.name, error = %e, "Failed to delete pod");
                    last_failure = Some(map_kube_err(e));
                }
            }
        }

        match (deleted, last_failure) {
            (0, Some(failure)) => Err(failure),
            _ => Ok(deleted),
        }
    }

    async fn patch_service_exposure(
        &self,
        namespace: &str,
        name: &str,
        exposure: Exposure,
    ) -> Result<(), CallError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({"spec": {"type": exposure.as_str()}});
        services
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(map_kube_err)?;
        debug!(service = %name, exposure = exposure.as_str(), "Patched service exposure");
        Ok(())
    }
}
