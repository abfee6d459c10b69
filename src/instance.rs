//! Per-instance connection abstraction used by the reconciler.

use std::ops::Deref;

use anyhow::Result;
use async_trait::async_trait;

use crate::keys::KeyMaterial;
use crate::vault::{ClientOptions, LeaderStatus, SealStatus, VaultClient};

/// Lifecycle operations against one secret-engine instance.
#[async_trait]
pub trait InstanceClient: Send + Sync {
    async fn init_status(&self) -> Result<bool>;

    async fn initialize(&self, shares: u8, threshold: u8) -> Result<KeyMaterial>;

    async fn seal_status(&self) -> Result<SealStatus>;

    /// Submits one key share.
    async fn unseal(&self, key: &str) -> Result<SealStatus>;

    async fn leader_status(&self) -> Result<LeaderStatus>;

    /// Same instance, authenticated with `token`.
    fn with_credential(&self, token: &str) -> Box<dyn InstanceClient>;
}

/// Builds clients for discovered addresses.
pub trait Connector: Send + Sync {
    /// # Errors
    /// Returns an error if no client can be built for `address`.
    fn connect(&self, address: &str, token: Option<&str>) -> Result<Box<dyn InstanceClient>>;
}

/// The single active client for an instance during a tick.
pub struct ClientHandle {
    client: Box<dyn InstanceClient>,
}

impl ClientHandle {
    #[must_use]
    pub fn new(client: Box<dyn InstanceClient>) -> Self {
        Self { client }
    }

    /// Replaces the active client with one bound to `token`.
    pub fn rebind(&mut self, token: &str) {
        self.client = self.client.with_credential(token);
    }
}

impl Deref for ClientHandle {
    type Target = dyn InstanceClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct VaultConnector {
    options: ClientOptions,
}

impl VaultConnector {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }
}

impl Connector for VaultConnector {
    fn connect(&self, address: &str, token: Option<&str>) -> Result<Box<dyn InstanceClient>> {
        let mut client = VaultClient::with_options(address, &self.options)?;
        if let Some(token) = token {
            client.set_token(token.to_string());
        }
        Ok(Box::new(client))
    }
}

#[async_trait]
impl InstanceClient for VaultClient {
    async fn init_status(&self) -> Result<bool> {
        self.is_initialized().await
    }

    async fn initialize(&self, shares: u8, threshold: u8) -> Result<KeyMaterial> {
        let response = self.init(shares, threshold).await?;
        Ok(KeyMaterial::from(response))
    }

    async fn seal_status(&self) -> Result<SealStatus> {
        VaultClient::seal_status(self).await
    }

    async fn unseal(&self, key: &str) -> Result<SealStatus> {
        VaultClient::unseal(self, key).await
    }

    async fn leader_status(&self) -> Result<LeaderStatus> {
        self.leader().await
    }

    fn with_credential(&self, token: &str) -> Box<dyn InstanceClient> {
        Box::new(self.with_token(token))
    }
}
