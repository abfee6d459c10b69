use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::discovery::{Directory, DiscoveryMode, SystemResolver};
use crate::health::{self, HealthState};
use crate::instance::VaultConnector;
use crate::platform::{KubePlatform, LocalSecretStore, PodDirectory, Remediator, SecretStore};
use crate::policy::PolicySync;
use crate::reconciler::Reconciler;

/// The wired controller: discovery, reconciler, policy sync and health state.
pub struct Controller {
    settings: Arc<Settings>,
    directory: Directory,
    reconciler: Arc<Reconciler>,
    policy: Option<PolicySync>,
    health: HealthState,
}

impl Controller {
    /// Wires Kubernetes capabilities when orchestrated, the local file store
    /// otherwise.
    ///
    /// # Errors
    /// Returns an error if the Kubernetes client or a Vault client cannot be
    /// built.
    pub async fn new(settings: Arc<Settings>) -> anyhow::Result<Self> {
        let connector = Arc::new(VaultConnector::new(settings.client_options()?));
        let (store, remediator, pods, policy): (
            Arc<dyn SecretStore>,
            Option<Arc<dyn Remediator>>,
            Option<Arc<dyn PodDirectory>>,
            Option<PolicySync>,
        ) = if settings.orchestrated {
            let platform = Arc::new(KubePlatform::try_default().await?);
            let store: Arc<dyn SecretStore> = platform.clone();
            let policy = PolicySync::new(
                Arc::clone(&settings),
                platform.clone(),
                Arc::clone(&store),
            )?;
            info!("Running under Kubernetes in namespace {}", settings.namespace);
            (
                store,
                Some(platform.clone() as Arc<dyn Remediator>),
                Some(platform as Arc<dyn PodDirectory>),
                Some(policy),
            )
        } else {
            info!(
                "Running off-cluster; key material goes to {}",
                settings.store.local_dir.display()
            );
            (
                Arc::new(LocalSecretStore::new(settings.store.local_dir.clone())),
                None,
                None,
                None,
            )
        };

        let directory = Directory::new(&settings, Arc::new(SystemResolver), pods);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&settings),
            connector,
            store,
            remediator,
        ));
        Ok(Self {
            settings,
            directory,
            reconciler,
            policy,
            health: HealthState::default(),
        })
    }

    #[must_use]
    pub fn health(&self) -> &HealthState {
        &self.health
    }

    /// Runs the reconcile loop, the policy loop and the health server until
    /// SIGINT or SIGTERM.
    ///
    /// # Errors
    /// Returns an error if an interval or the health listen address is invalid.
    pub async fn run(self) -> anyhow::Result<()> {
        let reload_frequency = self.settings.reload_frequency()?;
        let policy_interval = self.settings.policy_sync_interval()?;
        let listen_addr: SocketAddr = self
            .settings
            .health
            .listen_addr
            .parse()
            .with_context(|| {
                format!(
                    "Failed to parse health listen_addr {}",
                    self.settings.health.listen_addr
                )
            })?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shutdown_handle = tokio::spawn(async move {
            if let Err(err) = wait_for_shutdown().await {
                error!("Shutdown signal handler error: {err}");
            }
            let _ = shutdown_tx.send(true);
        });

        let health_state = self.health.clone();
        let health_shutdown = shutdown_rx.clone();
        let health_handle = tokio::spawn(async move {
            if let Err(err) = health::serve(listen_addr, health_state, health_shutdown).await {
                error!("Health server failed: {err:#}");
            }
        });

        let policy_handle = self.policy.map(|policy| {
            tokio::spawn(run_policy_loop(
                policy,
                policy_interval,
                self.health.clone(),
                shutdown_rx.clone(),
            ))
        });
        if policy_handle.is_none() {
            info!("Policy sync disabled off-cluster");
        }

        info!(
            "Controller started. reload_frequency={:?}, policy_sync_interval={:?}, max_concurrent_instances={}",
            reload_frequency, policy_interval, self.settings.daemon.max_concurrent_instances
        );

        let mut shutdown = shutdown_rx;
        let mut first_tick = true;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = if first_tick {
                first_tick = false;
                Duration::from_secs(0)
            } else {
                reload_frequency
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(delay) => {
                    run_tick(
                        &self.settings,
                        &self.directory,
                        &self.reconciler,
                        &self.health,
                        &shutdown,
                    )
                    .await;
                }
            }
        }
        info!("Shutdown signal received. Exiting.");

        let _ = shutdown_handle.await;
        for (label, handle) in [("Policy sync", policy_handle), ("Health server", Some(health_handle))]
        {
            if let Some(handle) = handle
                && let Err(err) = handle.await
            {
                error!("{label} task join error: {err}");
            }
        }
        Ok(())
    }

    /// Runs one reconcile tick and one policy cycle.
    pub async fn run_oneshot(&self) {
        let (_shutdown_tx, shutdown) = watch::channel(false);
        run_tick(
            &self.settings,
            &self.directory,
            &self.reconciler,
            &self.health,
            &shutdown,
        )
        .await;
        if let Some(policy) = &self.policy {
            self.health.record_policy_sync(policy.run_cycle().await).await;
        }
        let snapshot = self.health.snapshot().await;
        info!(
            "Oneshot finished: {} instance(s), {} initialised, {} remediated",
            snapshot.instances.len(),
            snapshot.initializations,
            snapshot.remediations
        );
    }
}

async fn run_tick(
    settings: &Settings,
    directory: &Directory,
    reconciler: &Arc<Reconciler>,
    health: &HealthState,
    shutdown: &watch::Receiver<bool>,
) {
    let instances = match DiscoveryMode::from_settings(settings) {
        Ok(mode) => directory.discover(&mode).await,
        Err(err) => Err(err),
    };
    let instances = match instances {
        Ok(instances) => instances,
        Err(err) => {
            error!("Discovery failed, skipping tick: {err:#}");
            return;
        }
    };
    if instances.is_empty() {
        warn!("No instances discovered");
    }
    let reports = reconciler.reconcile_fleet(&instances, shutdown).await;
    health.record_tick(reports).await;
}

async fn run_policy_loop(
    policy: PolicySync,
    interval: Duration,
    health: HealthState,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut first_tick = true;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let delay = if first_tick {
            first_tick = false;
            Duration::from_secs(0)
        } else {
            interval
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(delay) => {
                let report = policy.run_cycle().await;
                health.record_policy_sync(report).await;
            }
        }
    }
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {e}"))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {e}"))?;
            }
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {e}"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn off_cluster_settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::new(None).unwrap();
        settings.store.local_dir = dir.to_path_buf();
        settings
    }

    #[tokio::test]
    async fn test_off_cluster_controller_has_no_policy_sync() {
        let dir = tempdir().unwrap();

        let controller = Controller::new(Arc::new(off_cluster_settings(dir.path())))
            .await
            .unwrap();

        assert!(controller.policy.is_none());
    }

    #[tokio::test]
    async fn test_tick_without_discovery_mode_is_skipped() {
        let dir = tempdir().unwrap();
        let controller = Controller::new(Arc::new(off_cluster_settings(dir.path())))
            .await
            .unwrap();

        controller.run_oneshot().await;

        let snapshot = controller.health.snapshot().await;
        assert_eq!(snapshot.ticks, 0);
    }

    #[tokio::test]
    async fn test_tick_records_unresolvable_static_hosts() {
        let dir = tempdir().unwrap();
        let mut settings = off_cluster_settings(dir.path());
        settings.discovery.instances = vec!["vault-0.invalid".to_string()];
        let controller = Controller::new(Arc::new(settings)).await.unwrap();

        controller.run_oneshot().await;

        let snapshot = controller.health.snapshot().await;
        assert_eq!(snapshot.ticks, 1);
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(
            snapshot.instances[0].condition.as_deref(),
            Some("instance address could not be resolved")
        );
        assert!(!snapshot.instances[0].remediated);
    }
}
