use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::vault::ClientOptions;

mod defaults;
mod validation;

const DEFAULT_CONFIG_PATH: &str = "vault-controller.toml";
const ENV_PREFIX: &str = "VAULT_CONTROLLER";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Namespace used for pod discovery and key material storage
    pub namespace: String,
    /// Whether the controller runs under Kubernetes (pod discovery,
    /// remediation and policy sync are only available then)
    #[serde(default)]
    pub orchestrated: bool,
    pub discovery: DiscoverySettings,
    pub vault: VaultSettings,
    pub init: InitSettings,
    pub unseal: UnsealSettings,
    pub root_token: SecretLocation,
    pub store: StoreSettings,
    pub daemon: DaemonSettings,
    pub health: HealthSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoverySettings {
    pub label: String,
    /// Static host list; bypasses pod discovery when non-empty
    #[serde(default)]
    pub instances: Vec<String>,
}

#[derive(Deserialize, Clone)]
pub struct VaultSettings {
    /// Service address used by the policy sync task
    pub addr: String,
    pub port: u16,
    pub scheme: String,
    /// Bootstrap token for already-initialised clusters
    #[serde(default)]
    pub token: Option<String>,
    pub tls_skip_verify: bool,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    pub request_timeout_secs: u64,
    /// Pause after a successful initialise before the next call
    pub init_wait_secs: u64,
}

impl fmt::Debug for VaultSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSettings")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("tls_skip_verify", &self.tls_skip_verify)
            .field("ca_cert", &self.ca_cert)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("init_wait_secs", &self.init_wait_secs)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct InitSettings {
    pub shares: u8,
    pub threshold: u8,
}

#[derive(Deserialize, Clone)]
pub struct UnsealSettings {
    /// Externally supplied key shares; bypass the secret store when set
    #[serde(default)]
    pub keys: Vec<String>,
    pub secret_name: String,
    pub secret_key: String,
}

impl fmt::Debug for UnsealSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealSettings")
            .field("keys", &self.keys.len())
            .field("secret_name", &self.secret_name)
            .field("secret_key", &self.secret_key)
            .finish()
    }
}

impl UnsealSettings {
    #[must_use]
    pub fn location(&self) -> SecretLocation {
        SecretLocation {
            secret_name: self.secret_name.clone(),
            secret_key: self.secret_key.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SecretLocation {
    pub secret_name: String,
    pub secret_key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    /// Root directory for key material when not orchestrated
    pub local_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonSettings {
    pub reload_frequency: String,
    pub policy_sync_interval: String,
    pub max_concurrent_instances: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthSettings {
    pub listen_addr: String,
}

impl Settings {
    /// Creates a new `Settings` instance.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails (e.g. invalid format).
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load(config_path, environment())
    }

    fn load(config_path: Option<PathBuf>, env: Environment) -> Result<Self, ConfigError> {
        let mut s = defaults::apply_defaults(Config::builder())?;

        let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        s = s.add_source(File::from(path).required(false));
        s = s.add_source(env);

        s.build()?.try_deserialize()
    }

    /// Merges CLI arguments and the legacy environment variables they carry,
    /// overriding values if present.
    pub fn merge_with_args(&mut self, args: &crate::Args) {
        if let Some(label) = &args.label {
            label.clone_into(&mut self.discovery.label);
        }
        if let Some(namespace) = &args.namespace {
            namespace.clone_into(&mut self.namespace);
        }
        if let Some(addr) = &args.vault_addr {
            addr.clone_into(&mut self.vault.addr);
        }
        if let Some(port) = args.vault_port {
            self.vault.port = port;
        }
        if let Some(scheme) = &args.vault_scheme {
            scheme.clone_into(&mut self.vault.scheme);
        }
        if let Some(token) = &args.vault_token {
            self.vault.token = Some(token.clone());
        }
        if let Some(skip) = args.tls_skip_verify {
            self.vault.tls_skip_verify = skip;
        }
        if let Some(ca_cert) = &args.ca_cert {
            self.vault.ca_cert = Some(ca_cert.clone());
        }
        if let Some(shares) = args.init_shares {
            self.init.shares = shares;
        }
        if let Some(threshold) = args.init_threshold {
            self.init.threshold = threshold;
        }
        if !args.instances.is_empty() {
            self.discovery.instances.clone_from(&args.instances);
        }
        if let Some(frequency) = &args.reload_frequency {
            frequency.clone_into(&mut self.daemon.reload_frequency);
        }
        if let Some(interval) = &args.policy_sync_interval {
            interval.clone_into(&mut self.daemon.policy_sync_interval);
        }
        if !args.unseal_keys.is_empty() {
            self.unseal.keys.clone_from(&args.unseal_keys);
        }
        if let Some(name) = &args.unseal_secret_name {
            name.clone_into(&mut self.unseal.secret_name);
        }
        if let Some(key) = &args.unseal_secret_key {
            key.clone_into(&mut self.unseal.secret_key);
        }
        if let Some(name) = &args.token_secret_name {
            name.clone_into(&mut self.root_token.secret_name);
        }
        if let Some(key) = &args.token_secret_key {
            key.clone_into(&mut self.root_token.secret_key);
        }
        if args
            .kubernetes_service_host
            .as_deref()
            .is_some_and(|host| !host.trim().is_empty())
        {
            self.orchestrated = true;
        }
        self.discovery.instances = normalize_list(&self.discovery.instances);
        self.unseal.keys = normalize_list(&self.unseal.keys);
        self.vault.token = self.vault.token.take().filter(|t| !t.trim().is_empty());
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        validation::validate_settings(self)
    }

    /// Main loop period.
    ///
    /// # Errors
    /// Returns error if `daemon.reload_frequency` is not a duration.
    pub fn reload_frequency(&self) -> Result<Duration> {
        parse_interval(&self.daemon.reload_frequency, "daemon.reload_frequency")
    }

    /// Policy sync period.
    ///
    /// # Errors
    /// Returns error if `daemon.policy_sync_interval` is not a duration.
    pub fn policy_sync_interval(&self) -> Result<Duration> {
        parse_interval(
            &self.daemon.policy_sync_interval,
            "daemon.policy_sync_interval",
        )
    }

    /// Builds the HTTP options every Vault client shares.
    ///
    /// # Errors
    /// Returns error if the configured CA bundle cannot be read.
    pub fn client_options(&self) -> Result<ClientOptions> {
        let ca_cert_pem = self
            .vault
            .ca_cert
            .as_ref()
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("Failed to read Vault CA bundle {}", path.display()))
            })
            .transpose()?;
        Ok(ClientOptions {
            timeout: Some(Duration::from_secs(self.vault.request_timeout_secs)),
            tls_skip_verify: self.vault.tls_skip_verify,
            ca_cert_pem,
        })
    }

    #[must_use]
    pub fn init_wait(&self) -> Duration {
        Duration::from_secs(self.vault.init_wait_secs)
    }
}

// e.g. VAULT_CONTROLLER_INIT__SHARES, VAULT_CONTROLLER_DISCOVERY__INSTANCES
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .ignore_empty(true)
        .list_separator(",")
        .with_list_parse_key("discovery.instances")
        .with_list_parse_key("unseal.keys")
}

fn parse_interval(value: &str, label: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .with_context(|| format!("{label} is not a valid duration: {value}"))
}

fn normalize_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}
