use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use super::{PodDirectory, PolicySource, Remediator, SecretStore};
use crate::discovery::{EndpointState, PodEndpoint};
use crate::policy::{Policy, PolicyResource};

const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "vault-controller";
const SECRET_TYPE_OPAQUE: &str = "Opaque";
const PHASE_FAILED: &str = "Failed";
const PHASE_UNKNOWN: &str = "Unknown";
const REASON_CRASH_LOOP: &str = "CrashLoopBackOff";

/// Kubernetes-backed implementation of every platform capability.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl std::fmt::Debug for KubePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePlatform").finish_non_exhaustive()
    }
}

impl KubePlatform {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects using in-cluster configuration or the local kubeconfig.
    ///
    /// # Errors
    /// Returns an error if no usable Kubernetes configuration is found.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl SecretStore for KubePlatform {
    async fn get(&self, name: &str, key: &str, namespace: &str) -> Result<Option<String>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = secrets
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to read secret {namespace}/{name}"))?
        else {
            return Ok(None);
        };
        secret_value(&secret, key)
            .with_context(|| format!("Secret {namespace}/{name}:{key} is not valid UTF-8"))
    }

    async fn put(&self, name: &str, key: &str, value: &str, namespace: &str) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let existing = secrets
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to read secret {namespace}/{name}"))?;
        match existing {
            Some(mut secret) => {
                secret
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
                secrets
                    .replace(name, &PostParams::default(), &secret)
                    .await
                    .with_context(|| format!("Failed to update secret {namespace}/{name}"))?;
                debug!("Updated secret {}/{}:{}", namespace, name, key);
            }
            None => {
                secrets
                    .create(&PostParams::default(), &new_secret(name, key, value, namespace))
                    .await
                    .with_context(|| format!("Failed to create secret {namespace}/{name}"))?;
                debug!("Created secret {}/{}:{}", namespace, name, key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Remediator for KubePlatform {
    async fn remove_instance(&self, name: &str, namespace: &str) -> Result<bool> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted pod {}/{}", namespace, name);
                Ok(true)
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                debug!("No pod {}/{} to delete", namespace, name);
                Ok(false)
            }
            Err(err) => Err(err).with_context(|| format!("Failed to delete pod {namespace}/{name}")),
        }
    }
}

#[async_trait]
impl PodDirectory for KubePlatform {
    async fn pod_endpoints(&self, selector: &str, namespace: &str) -> Result<Vec<PodEndpoint>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .with_context(|| format!("Failed to list pods in {namespace} matching {selector}"))?;
        Ok(list
            .items
            .iter()
            .map(|pod| PodEndpoint {
                name: pod.name_any(),
                state: endpoint_state(pod),
            })
            .collect())
    }
}

#[async_trait]
impl PolicySource for KubePlatform {
    async fn list_policies(&self) -> Result<Vec<PolicyResource>> {
        let policies: Api<Policy> = Api::all(self.client.clone());
        let list = policies
            .list(&ListParams::default())
            .await
            .context("Failed to list Policy resources")?;
        Ok(list.items.iter().map(PolicyResource::from).collect())
    }
}

fn secret_value(secret: &Secret, key: &str) -> Result<Option<String>> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| String::from_utf8(value.0.clone()))
        .transpose()
        .map_err(Into::into)
}

fn new_secret(name: &str, key: &str, value: &str, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            key.to_string(),
            ByteString(value.as_bytes().to_vec()),
        )])),
        type_: Some(SECRET_TYPE_OPAQUE.to_string()),
        ..Secret::default()
    }
}

/// Classifies a pod for discovery: failing pods surface as errors so they are
/// remediated, pods still waiting for an IP are skipped.
pub(crate) fn endpoint_state(pod: &Pod) -> EndpointState {
    let Some(status) = pod.status.as_ref() else {
        return EndpointState::Pending;
    };
    let phase = status.phase.as_deref().unwrap_or_default();
    if phase == PHASE_FAILED || phase == PHASE_UNKNOWN {
        return EndpointState::Failing(format!("pod phase {phase}"));
    }
    let crash_looping = status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|container| container.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .any(|reason| reason == REASON_CRASH_LOOP);
    if crash_looping {
        return EndpointState::Failing(REASON_CRASH_LOOP.to_string());
    }
    match status.pod_ip.as_deref().map(str::parse) {
        Some(Ok(ip)) => EndpointState::Ready(ip),
        Some(Err(_)) => EndpointState::Failing("unparsable pod IP".to_string()),
        None => EndpointState::Pending,
    }
}
