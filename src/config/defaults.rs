use config::{ConfigBuilder, ConfigError, builder::DefaultState};

const DEFAULT_NAMESPACE: &str = "kube-system";
const DEFAULT_LABEL: &str = "vault";
const DEFAULT_VAULT_ADDR: &str = "https://vault.kube-system.svc.cluster.local:8243";
const DEFAULT_VAULT_PORT: u16 = 8243;
const DEFAULT_VAULT_SCHEME: &str = "https";
const DEFAULT_TLS_SKIP_VERIFY: bool = false;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_INIT_WAIT_SECS: u64 = 5;
const DEFAULT_INIT_SHARES: u8 = 5;
const DEFAULT_INIT_THRESHOLD: u8 = 3;
const DEFAULT_UNSEAL_SECRET_NAME: &str = "vault-unseal-keys";
const DEFAULT_UNSEAL_SECRET_KEY: &str = "unseal-keys";
const DEFAULT_TOKEN_SECRET_NAME: &str = "vault-tokens";
const DEFAULT_TOKEN_SECRET_KEY: &str = "root-token";
const DEFAULT_LOCAL_STORE_DIR: &str = "secrets";
const DEFAULT_RELOAD_FREQUENCY: &str = "30s";
const DEFAULT_POLICY_SYNC_INTERVAL: &str = "30s";
const DEFAULT_MAX_CONCURRENT_INSTANCES: u64 = 1;
const DEFAULT_HEALTH_LISTEN_ADDR: &str = "0.0.0.0:8080";

pub(crate) fn apply_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("namespace", DEFAULT_NAMESPACE)?
        .set_default("orchestrated", false)?
        .set_default("discovery.label", DEFAULT_LABEL)?
        .set_default("discovery.instances", Vec::<String>::new())?
        .set_default("vault.addr", DEFAULT_VAULT_ADDR)?
        .set_default("vault.port", DEFAULT_VAULT_PORT)?
        .set_default("vault.scheme", DEFAULT_VAULT_SCHEME)?
        .set_default("vault.tls_skip_verify", DEFAULT_TLS_SKIP_VERIFY)?
        .set_default("vault.request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS)?
        .set_default("vault.init_wait_secs", DEFAULT_INIT_WAIT_SECS)?
        .set_default("init.shares", u64::from(DEFAULT_INIT_SHARES))?
        .set_default("init.threshold", u64::from(DEFAULT_INIT_THRESHOLD))?
        .set_default("unseal.keys", Vec::<String>::new())?
        .set_default("unseal.secret_name", DEFAULT_UNSEAL_SECRET_NAME)?
        .set_default("unseal.secret_key", DEFAULT_UNSEAL_SECRET_KEY)?
        .set_default("root_token.secret_name", DEFAULT_TOKEN_SECRET_NAME)?
        .set_default("root_token.secret_key", DEFAULT_TOKEN_SECRET_KEY)?
        .set_default("store.local_dir", DEFAULT_LOCAL_STORE_DIR)?
        .set_default("daemon.reload_frequency", DEFAULT_RELOAD_FREQUENCY)?
        .set_default("daemon.policy_sync_interval", DEFAULT_POLICY_SYNC_INTERVAL)?
        .set_default(
            "daemon.max_concurrent_instances",
            DEFAULT_MAX_CONCURRENT_INSTANCES,
        )?
        .set_default("health.listen_addr", DEFAULT_HEALTH_LISTEN_ADDR)
}
