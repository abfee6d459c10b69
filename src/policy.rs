//! `Policy` custom resources and their synchronisation into Vault.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::keys::KeyVault;
use crate::platform::{PolicySource, SecretStore};
use crate::vault::VaultClient;

/// ACL rules applied to Vault, with the TTL of the token issued for them.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vaultpolicy.io",
    version = "v1",
    kind = "Policy",
    plural = "policies",
    namespaced
)]
pub struct PolicySpec {
    /// HCL policy document
    pub rules: String,
    /// Token TTL, e.g. `1h`; Vault's default when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyResource {
    pub name: String,
    pub namespace: String,
    pub rules: String,
    pub ttl: Option<String>,
}

impl From<&Policy> for PolicyResource {
    fn from(policy: &Policy) -> Self {
        Self {
            name: policy.name_any(),
            namespace: policy.namespace().unwrap_or_default(),
            rules: policy.spec.rules.clone(),
            ttl: policy.spec.ttl.clone().filter(|ttl| !ttl.trim().is_empty()),
        }
    }
}

/// Applies one policy and issues a token bound to it.
#[async_trait]
pub trait PolicyWriter: Send + Sync {
    /// Returns the issued client token.
    async fn apply_policy(&self, policy: &PolicyResource) -> Result<String>;
}

#[async_trait]
impl PolicyWriter for VaultClient {
    async fn apply_policy(&self, policy: &PolicyResource) -> Result<String> {
        self.write_policy(&policy.name, &policy.rules).await?;
        self.create_token(
            &policy.name,
            std::slice::from_ref(&policy.name),
            policy.ttl.as_deref(),
        )
        .await
    }
}

/// Outcome of one policy sync cycle.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PolicySyncReport {
    pub synced: usize,
    /// Applied, but Vault returned no token to persist
    pub skipped: usize,
    pub failed: usize,
    /// Set when the cycle could not run at all
    pub error: Option<String>,
}

impl PolicySyncReport {
    fn aborted(message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::default()
        }
    }
}

/// Pushes every listed policy and persists each issued token under
/// `<namespace>/<name>:<name>`.
pub async fn sync_policies(
    source: &dyn PolicySource,
    writer: &dyn PolicyWriter,
    store: &dyn SecretStore,
) -> PolicySyncReport {
    let policies = match source.list_policies().await {
        Ok(policies) => policies,
        Err(err) => {
            error!("Failed to list policies: {:#}", err);
            return PolicySyncReport::aborted(format!("{err:#}"));
        }
    };

    let mut report = PolicySyncReport::default();
    for policy in &policies {
        let token = match writer.apply_policy(policy).await {
            Ok(token) => token,
            Err(err) => {
                error!(
                    "Failed to apply policy {}/{}: {:#}",
                    policy.namespace, policy.name, err
                );
                report.failed += 1;
                continue;
            }
        };
        if token.trim().is_empty() {
            warn!(
                "Policy {}/{} applied but no token was issued",
                policy.namespace, policy.name
            );
            report.skipped += 1;
            continue;
        }
        match store
            .put(&policy.name, &policy.name, &token, &policy.namespace)
            .await
        {
            Ok(()) => {
                debug!("Synced policy {}/{}", policy.namespace, policy.name);
                report.synced += 1;
            }
            Err(err) => {
                error!(
                    "Failed to store token for policy {}/{}: {:#}",
                    policy.namespace, policy.name, err
                );
                report.failed += 1;
            }
        }
    }
    info!(
        "Policy sync finished: {} synced, {} skipped, {} failed",
        report.synced, report.skipped, report.failed
    );
    report
}

/// Runs sync cycles against the service address.
pub struct PolicySync {
    settings: Arc<Settings>,
    client: VaultClient,
    source: Arc<dyn PolicySource>,
    store: Arc<dyn SecretStore>,
}

impl PolicySync {
    /// # Errors
    /// Returns an error if the client for `vault.addr` cannot be built.
    pub fn new(
        settings: Arc<Settings>,
        source: Arc<dyn PolicySource>,
        store: Arc<dyn SecretStore>,
    ) -> Result<Self> {
        let client = VaultClient::with_options(&settings.vault.addr, &settings.client_options()?)?;
        Ok(Self {
            settings,
            client,
            source,
            store,
        })
    }

    pub async fn run_cycle(&self) -> PolicySyncReport {
        let token = match self.credential().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                error!("Skipping policy sync: no bootstrap token configured and no root token stored");
                return PolicySyncReport::aborted("no Vault token available".to_string());
            }
            Err(err) => {
                error!("Skipping policy sync: {:#}", err);
                return PolicySyncReport::aborted(format!("{err:#}"));
            }
        };
        let client = self.client.with_token(&token);
        sync_policies(self.source.as_ref(), &client, self.store.as_ref()).await
    }

    /// Bootstrap token first, then the stored root credential.
    async fn credential(&self) -> Result<Option<String>> {
        if let Some(token) = &self.settings.vault.token {
            return Ok(Some(token.clone()));
        }
        let root = KeyVault::new(self.store.as_ref(), &self.settings)
            .load_root()
            .await?;
        Ok(root.map(|root| root.expose().to_string()))
    }
}
