use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vault_controller::{Args, config::Settings, daemon::Controller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);
    // kube and reqwest both pull in rustls; pick the provider explicitly.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting vault-controller");
    let settings = load_settings(&args)?;
    log_settings(&settings);

    let controller = Controller::new(Arc::new(settings)).await?;
    if args.oneshot {
        controller.run_oneshot().await;
        return Ok(());
    }
    controller.run().await
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = Settings::new(args.config.clone())?;
    settings.merge_with_args(args);
    settings.validate()?;
    Ok(settings)
}

fn log_settings(settings: &Settings) {
    if settings.discovery.instances.is_empty() {
        info!(
            "Discovering pods labelled {} in {}",
            settings.discovery.label, settings.namespace
        );
    } else {
        info!("Static instances: {}", settings.discovery.instances.join(", "));
    }
    info!(
        "Init shares={}, threshold={}; unseal keys configured: {}",
        settings.init.shares,
        settings.init.threshold,
        settings.unseal.keys.len()
    );
    if settings.vault.token.is_some() {
        info!("Using bootstrap token for Vault requests");
    }
    if settings.vault.tls_skip_verify {
        info!("TLS verification for Vault connections is disabled");
    }
}
