use std::path::PathBuf;

use clap::Parser;

/// Keeps a Vault fleet discovered, initialised, unsealed and led, and turns
/// `Policy` resources into scoped tokens.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (default: vault-controller.toml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Run one reconciliation tick and one policy sync, then exit
    #[arg(long)]
    pub oneshot: bool,

    /// Enable debug logging (ignored when `RUST_LOG` is set)
    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    /// Pod label used for instance discovery
    #[arg(long, env = "VAULT_LABEL")]
    pub label: Option<String>,

    /// Namespace for discovery and key material storage
    #[arg(long, env = "VAULT_NAMESPACE")]
    pub namespace: Option<String>,

    /// Vault service address used by the policy sync task
    #[arg(long = "vault-addr", env = "VAULT_ADDR")]
    pub vault_addr: Option<String>,

    /// Port appended to discovered instance addresses
    #[arg(long = "vault-port", env = "VAULT_PORT")]
    pub vault_port: Option<u16>,

    /// Scheme for discovered instance addresses (http or https)
    #[arg(long = "vault-scheme", env = "VAULT_SCHEME")]
    pub vault_scheme: Option<String>,

    /// Bootstrap token for already-initialised clusters
    #[arg(long = "vault-token", env = "VAULT_TOKEN", hide_env_values = true)]
    pub vault_token: Option<String>,

    /// Skip TLS certificate verification for Vault connections
    #[arg(
        long = "tls-skip-verify",
        env = "VAULT_SKIP_VERIFY",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub tls_skip_verify: Option<bool>,

    /// PEM CA bundle used to verify Vault connections
    #[arg(long = "ca-cert", env = "VAULT_CACERT")]
    pub ca_cert: Option<PathBuf>,

    /// Number of unseal key shares generated at initialisation
    #[arg(long = "init-shares", env = "VAULT_INIT_SHARES")]
    pub init_shares: Option<u8>,

    /// Number of shares required to unseal
    #[arg(long = "init-threshold", env = "VAULT_INIT_THRESHOLD")]
    pub init_threshold: Option<u8>,

    /// Comma-separated static instance hosts (bypasses pod discovery)
    #[arg(long, env = "VAULT_INSTANCES", value_delimiter = ',')]
    pub instances: Vec<String>,

    /// Main loop period (e.g. 30s, 1m)
    #[arg(long = "reload-frequency", env = "RELOAD_FREQUENCY")]
    pub reload_frequency: Option<String>,

    /// Policy sync period (e.g. 30s, 1m)
    #[arg(long = "policy-sync-interval", env = "POLICY_SYNC_INTERVAL")]
    pub policy_sync_interval: Option<String>,

    /// Externally supplied unseal key shares (bypasses the secret store)
    #[arg(
        long = "unseal-keys",
        env = "VAULT_UNSEAL_KEYS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub unseal_keys: Vec<String>,

    /// Secret holding the unseal key shares
    #[arg(long = "unseal-secret-name", env = "VAULT_UNSEAL_SECRET_NAME")]
    pub unseal_secret_name: Option<String>,

    /// Key within the unseal secret
    #[arg(long = "unseal-secret-key", env = "VAULT_UNSEAL_SECRET_KEY")]
    pub unseal_secret_key: Option<String>,

    /// Secret holding the root token
    #[arg(long = "token-secret-name", env = "VAULT_TOKEN_SECRET_NAME")]
    pub token_secret_name: Option<String>,

    /// Key within the root token secret
    #[arg(long = "token-secret-key", env = "VAULT_TOKEN_SECRET_KEY")]
    pub token_secret_key: Option<String>,

    #[arg(long, env = "KUBERNETES_SERVICE_HOST", hide = true)]
    pub kubernetes_service_host: Option<String>,
}
