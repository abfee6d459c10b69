use std::net::SocketAddr;

use anyhow::Result;

use super::{SecretLocation, Settings};

const SUPPORTED_SCHEMES: [&str; 2] = ["http", "https"];

pub(crate) fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.namespace.trim().is_empty() {
        anyhow::bail!("namespace must not be empty");
    }
    if settings.discovery.label.trim().is_empty() {
        anyhow::bail!("discovery.label must not be empty");
    }
    if settings.vault.addr.trim().is_empty() {
        anyhow::bail!("vault.addr must not be empty");
    }
    if !SUPPORTED_SCHEMES.contains(&settings.vault.scheme.as_str()) {
        anyhow::bail!(
            "vault.scheme must be one of {}, got {}",
            SUPPORTED_SCHEMES.join(", "),
            settings.vault.scheme
        );
    }
    if settings.vault.port == 0 {
        anyhow::bail!("vault.port must be greater than 0");
    }
    if settings.vault.request_timeout_secs == 0 {
        anyhow::bail!("vault.request_timeout_secs must be greater than 0");
    }
    validate_init(settings.init.shares, settings.init.threshold)?;
    validate_location(&settings.unseal.location(), "unseal")?;
    validate_location(&settings.root_token, "root_token")?;
    if settings.unseal.location() == settings.root_token {
        anyhow::bail!("unseal keys and root token must be stored under different secret keys");
    }
    if settings.store.local_dir.as_os_str().is_empty() {
        anyhow::bail!("store.local_dir must not be empty");
    }
    if settings.reload_frequency()?.is_zero() {
        anyhow::bail!("daemon.reload_frequency must be greater than 0");
    }
    if settings.policy_sync_interval()?.is_zero() {
        anyhow::bail!("daemon.policy_sync_interval must be greater than 0");
    }
    if settings.daemon.max_concurrent_instances == 0 {
        anyhow::bail!("daemon.max_concurrent_instances must be greater than 0");
    }
    settings
        .health
        .listen_addr
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("health.listen_addr invalid: {e}"))?;
    Ok(())
}

fn validate_init(shares: u8, threshold: u8) -> Result<()> {
    if shares == 0 {
        anyhow::bail!("init.shares must be greater than 0");
    }
    if threshold == 0 {
        anyhow::bail!("init.threshold must be greater than 0");
    }
    if threshold > shares {
        anyhow::bail!("init.threshold must be <= init.shares");
    }
    if shares > 1 && threshold == 1 {
        anyhow::bail!("init.threshold must be greater than 1 when init.shares > 1");
    }
    Ok(())
}

fn validate_location(location: &SecretLocation, label: &str) -> Result<()> {
    if location.secret_name.trim().is_empty() {
        anyhow::bail!("{label}.secret_name must not be empty");
    }
    if location.secret_key.trim().is_empty() {
        anyhow::bail!("{label}.secret_key must not be empty");
    }
    Ok(())
}
