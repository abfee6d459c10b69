//! Capabilities the controller consumes from the hosting platform.
//!
//! Every seam is a trait so the reconciler can be driven against in-memory
//! fakes; production wiring uses [`KubePlatform`] under Kubernetes and
//! [`LocalSecretStore`] otherwise.

use anyhow::Result;
use async_trait::async_trait;

use crate::discovery::PodEndpoint;
use crate::policy::PolicyResource;

mod kubernetes;
mod local;

pub use kubernetes::KubePlatform;
pub use local::LocalSecretStore;

/// Durable key/value storage for key material and issued tokens.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Reads `key` of secret `name`; `Ok(None)` when either does not exist.
    async fn get(&self, name: &str, key: &str, namespace: &str) -> Result<Option<String>>;

    /// Creates or updates `key` of secret `name`, preserving other keys.
    async fn put(&self, name: &str, key: &str, value: &str, namespace: &str) -> Result<()>;
}

/// Removes an unhealthy instance so the platform schedules a replacement.
#[async_trait]
pub trait Remediator: Send + Sync {
    /// Returns `false` when there was nothing to remove.
    async fn remove_instance(&self, name: &str, namespace: &str) -> Result<bool>;
}

/// Lists workload units matching a label selector.
#[async_trait]
pub trait PodDirectory: Send + Sync {
    async fn pod_endpoints(&self, selector: &str, namespace: &str) -> Result<Vec<PodEndpoint>>;
}

/// Lists declarative policy resources.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn list_policies(&self) -> Result<Vec<PolicyResource>>;
}
