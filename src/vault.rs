use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Certificate, Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection options shared by every client the controller builds.
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub timeout: Option<Duration>,
    pub tls_skip_verify: bool,
    pub ca_cert_pem: Option<Vec<u8>>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("timeout", &self.timeout)
            .field("tls_skip_verify", &self.tls_skip_verify)
            .field("ca_cert", &self.ca_cert_pem.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct VaultClient {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
pub struct InitStatus {
    pub initialized: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SealStatus {
    pub sealed: bool,
    #[serde(default)]
    pub t: Option<u32>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub progress: Option<u32>,
}

#[derive(Deserialize, Clone)]
pub struct InitResponse {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    pub root_token: String,
}

impl fmt::Debug for InitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitResponse")
            .field("keys", &self.keys.len())
            .field("keys_base64", &self.keys_base64.len())
            .field("root_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LeaderStatus {
    #[serde(default)]
    pub ha_enabled: bool,
    pub is_self: bool,
    #[serde(default)]
    pub leader_address: String,
}

#[derive(Debug, Deserialize)]
struct TokenCreateResponse {
    auth: TokenAuth,
}

#[derive(Debug, Deserialize)]
struct TokenAuth {
    #[serde(default)]
    client_token: String,
}

impl VaultClient {
    /// Builds a client with default connection options.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_options(base_url, &ClientOptions::default())
    }

    /// Builds a client honouring timeout and TLS options.
    ///
    /// # Errors
    /// Returns an error if the address is empty, the CA bundle is invalid, or
    /// the HTTP client cannot be constructed.
    pub fn with_options(base_url: &str, options: &ClientOptions) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            anyhow::bail!("Vault address must not be empty");
        }
        let mut builder = Client::builder()
            .timeout(options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
            .danger_accept_invalid_certs(options.tls_skip_verify);
        if let Some(pem) = &options.ca_cert_pem {
            let cert = Certificate::from_pem(pem).context("Failed to parse Vault CA certificate")?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .context("Failed to build Vault HTTP client")?;
        Ok(Self {
            base_url: base_url.to_string(),
            client,
            token: None,
        })
    }

    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Returns a copy of this client authenticated with `token`, sharing the
    /// underlying connection pool.
    #[must_use]
    pub fn with_token(&self, token: &str) -> Self {
        Self {
            base_url: self.base_url.clone(),
            client: self.client.clone(),
            token: Some(token.to_string()),
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.base_url
    }

    pub async fn is_initialized(&self) -> Result<bool> {
        let status: InitStatus = self.get_json("sys/init", false).await?;
        Ok(status.initialized)
    }

    pub async fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse> {
        #[derive(Serialize)]
        struct InitRequest {
            secret_shares: u8,
            secret_threshold: u8,
        }
        let url = self.endpoint("sys/init");
        let response = self
            .client
            .put(url)
            .json(&InitRequest {
                secret_shares: shares,
                secret_threshold: threshold,
            })
            .send()
            .await
            .context("Vault init request failed")?;
        Self::parse_response(response).await
    }

    pub async fn seal_status(&self) -> Result<SealStatus> {
        self.get_json("sys/seal-status", false).await
    }

    pub async fn unseal(&self, key: &str) -> Result<SealStatus> {
        #[derive(Serialize)]
        struct UnsealRequest<'a> {
            key: &'a str,
        }
        let url = self.endpoint("sys/unseal");
        let response = self
            .client
            .put(url)
            .json(&UnsealRequest { key })
            .send()
            .await
            .context("Vault unseal request failed")?;
        Self::parse_response(response).await
    }

    pub async fn leader(&self) -> Result<LeaderStatus> {
        self.get_json("sys/leader", false).await
    }

    pub async fn write_policy(&self, name: &str, policy: &str) -> Result<()> {
        #[derive(Serialize)]
        struct PolicyRequest<'a> {
            policy: &'a str,
        }
        let _: serde_json::Value = self
            .send_json(
                Method::PUT,
                &format!("sys/policies/acl/{name}"),
                &PolicyRequest { policy },
            )
            .await?;
        Ok(())
    }

    /// Creates a token carrying `policies`, returning its client token.
    pub async fn create_token(
        &self,
        display_name: &str,
        policies: &[String],
        ttl: Option<&str>,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct TokenRequest<'a> {
            display_name: &'a str,
            policies: &'a [String],
            #[serde(skip_serializing_if = "Option::is_none")]
            ttl: Option<&'a str>,
        }
        let response: TokenCreateResponse = self
            .send_json(
                Method::POST,
                "auth/token/create",
                &TokenRequest {
                    display_name,
                    policies,
                    ttl,
                },
            )
            .await?;
        Ok(response.auth.client_token)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        use_token: bool,
    ) -> Result<T> {
        let url = self.endpoint(path);
        let mut request = self.client.get(url);
        if use_token {
            let token = self
                .token
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Vault token is not set"))?;
            request = request.header(VAULT_TOKEN_HEADER, token);
        } else if let Some(token) = &self.token {
            request = request.header(VAULT_TOKEN_HEADER, token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Vault request failed: {path}"))?;
        Self::parse_response(response)
            .await
            .with_context(|| format!("Vault response parse failed: {path}"))
    }

    async fn send_json<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<R> {
        let url = self.endpoint(path);
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Vault token is not set"))?;
        let response = self
            .client
            .request(method, url)
            .header(VAULT_TOKEN_HEADER, token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Vault request failed: {path}"))?;
        Self::parse_response(response)
            .await
            .with_context(|| format!("Vault response parse failed: {path}"))
    }

    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read Vault response body")?;
        if !status.is_success() {
            anyhow::bail!("Vault API error ({status}): {text}");
        }
        if text.trim().is_empty() {
            let parsed =
                serde_json::from_str("null").context("Failed to parse empty Vault response")?;
            return Ok(parsed);
        }
        serde_json::from_str(&text).context("Failed to parse Vault response")
    }
}
