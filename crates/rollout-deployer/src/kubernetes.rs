//! Kubernetes compute platform.
//!
//! A service maps to a `Deployment` of the same name. Updating it patches
//! the container image, which makes the deployment controller start a new
//! ReplicaSet and replace old pods as new ones become ready.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, ListParams, Patch, PatchParams};
use rollout_core::artifact::ArtifactRef;
use rollout_core::deployer::{ComputePlatform, ServiceHealth, TaskSetId};
use rollout_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

const FIELD_MANAGER: &str = "rollout";

/// Kubernetes-based compute platform.
pub struct KubernetesPlatform {
    client: Client,
    namespace: String,
    /// Container to update; the first container when unset.
    container: Option<String>,
    /// Image most recently rolled out per service.
    targets: Mutex<HashMap<String, String>>,
}

impl KubernetesPlatform {
    pub async fn new(namespace: impl Into<String>, container: Option<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(client, namespace, container))
    }

    pub fn with_client(
        client: Client,
        namespace: impl Into<String>,
        container: Option<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            container,
            targets: Mutex::new(HashMap::new()),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn get_deployment(&self, service: &str) -> Result<Deployment> {
        self.deployments()
            .get(service)
            .await
            .map_err(|e| map_kube_error(service, e))
    }

    fn container_name(&self, deployment: &Deployment) -> Result<String> {
        if let Some(name) = &self.container {
            return Ok(name.clone());
        }
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone())
            .ok_or_else(|| Error::DeploymentFailed("deployment has no containers".to_string()))
    }

    /// Image the named container currently runs per the deployment spec.
    fn spec_image(deployment: &Deployment, container: &str) -> Option<String> {
        deployment
            .spec
            .as_ref()?
            .template
            .spec
            .as_ref()?
            .containers
            .iter()
            .find(|c| c.name == container)?
            .image
            .clone()
    }
}

#[async_trait]
impl ComputePlatform for KubernetesPlatform {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn update_service(&self, service: &str, artifact: &ArtifactRef) -> Result<TaskSetId> {
        let deployment = self.get_deployment(service).await?;
        let container = self.container_name(&deployment)?;
        let image = artifact.pinned();

        info!(
            service = %service,
            namespace = %self.namespace,
            container = %container,
            image = %image,
            "Updating deployment image"
        );

        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { "rollout.dev/tag": artifact.tag }
                    },
                    "spec": {
                        "containers": [{ "name": container, "image": image }]
                    }
                }
            }
        });

        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let patched = self
            .deployments()
            .patch(service, &params, &Patch::Strategic(&patch))
            .await
            .map_err(|e| map_kube_error(service, e))?;

        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service.to_string(), image);

        let generation = patched.metadata.generation.unwrap_or_default();
        Ok(TaskSetId::new(format!("{service}-{generation}")))
    }

    async fn service_health(&self, service: &str) -> Result<ServiceHealth> {
        let deployment = self.get_deployment(service).await?;
        let container = self.container_name(&deployment)?;

        let spec = deployment
            .spec
            .as_ref()
            .ok_or_else(|| Error::DeploymentFailed(format!("deployment {service} has no spec")))?;
        let desired = spec
            .replicas
            .and_then(|r| u32::try_from(r).ok())
            .unwrap_or(1);
        let selector = spec
            .selector
            .match_labels
            .as_ref()
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();

        let target = self
            .targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .cloned()
            .or_else(|| Self::spec_image(&deployment, &container))
            .ok_or_else(|| Error::DeploymentFailed(format!("no image for {service}")))?;

        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| map_kube_error(service, e))?;

        let health = summarize_pods(&pods.items, &container, &target, desired);
        debug!(service = %service, health = %health, "Observed service health");
        Ok(health)
    }
}

/// Health of the pods whose `container` runs `image`.
///
/// Restart counts are per pod lifetime; pods running the target image were
/// all started by the latest update, so their restarts are recent.
fn summarize_pods(pods: &[Pod], container: &str, image: &str, desired: u32) -> ServiceHealth {
    let mut health = ServiceHealth {
        desired,
        ..Default::default()
    };

    for pod in pods {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let runs_target = pod
            .spec
            .as_ref()
            .map(|s| {
                s.containers
                    .iter()
                    .any(|c| c.name == container && c.image.as_deref() == Some(image))
            })
            .unwrap_or(false);
        if !runs_target {
            continue;
        }

        let Some(status) = &pod.status else {
            continue;
        };

        let ready = status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == "Ready" && c.status == "True");
        if ready {
            health.healthy += 1;
        }

        let restarts: i32 = status
            .container_statuses
            .iter()
            .flatten()
            .map(|c| c.restart_count)
            .sum();
        health.recent_restarts += u32::try_from(restarts).unwrap_or(0);
    }

    health
}

fn map_kube_error(service: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => {
            Error::NotFound(format!("deployment {service}"))
        }
        other => Error::DeploymentFailed(format!("{service}: {other}")),
    }
}
