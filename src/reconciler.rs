//! Per-instance state machine: initialise once, unseal, check leadership, and
//! remediate instances that cannot be queried.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::discovery::{InstanceAddress, InstanceMap};
use crate::error::ReconcileError;
use crate::instance::{ClientHandle, Connector};
use crate::keys::{KeyMaterial, KeyVault, UnsealKeySet};
use crate::platform::{Remediator, SecretStore};
use crate::vault::{LeaderStatus, SealStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SealState {
    Sealed,
    Unsealed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderState {
    Leader,
    Standby,
    /// The leader query failed
    Unknown,
}

impl From<&LeaderStatus> for LeaderState {
    fn from(status: &LeaderStatus) -> Self {
        // A node without HA is the only active node.
        if status.is_self || !status.ha_enabled {
            Self::Leader
        } else {
            Self::Standby
        }
    }
}

/// What one tick observed and did for one instance.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstanceReport {
    pub name: String,
    pub address: Option<String>,
    pub initialized: Option<bool>,
    /// Initialised by the controller during this tick
    pub initialized_now: bool,
    pub seal: Option<SealState>,
    pub leader: Option<LeaderState>,
    pub condition: Option<String>,
    pub remediated: bool,
}

impl InstanceReport {
    fn new(name: &str, address: &InstanceAddress) -> Self {
        Self {
            name: name.to_string(),
            address: match address {
                InstanceAddress::Resolved(address) => Some(address.clone()),
                InstanceAddress::Unresolvable(_) | InstanceAddress::Pending => None,
            },
            initialized: None,
            initialized_now: false,
            seal: None,
            leader: None,
            condition: None,
            remediated: false,
        }
    }
}

pub struct Reconciler {
    settings: Arc<Settings>,
    connector: Arc<dyn Connector>,
    store: Arc<dyn SecretStore>,
    /// Present only when orchestrated.
    remediator: Option<Arc<dyn Remediator>>,
    /// Key material from an initialise whose write failed. Also serialises
    /// the read-store/initialise/persist sequence across instances.
    unpersisted: Mutex<Option<KeyMaterial>>,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        settings: Arc<Settings>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn SecretStore>,
        remediator: Option<Arc<dyn Remediator>>,
    ) -> Self {
        Self {
            settings,
            connector,
            store,
            remediator,
            unpersisted: Mutex::new(None),
        }
    }

    /// Reconciles every addressable instance once, returning reports in name
    /// order. Pending instances are skipped.
    pub async fn reconcile_fleet(
        self: &Arc<Self>,
        instances: &InstanceMap,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<InstanceReport> {
        self.flush_unpersisted().await;

        let semaphore = Arc::new(Semaphore::new(self.permits()));
        let mut tasks = JoinSet::new();
        for (name, address) in instances {
            if *address == InstanceAddress::Pending {
                debug!(instance = %name, "Skipping instance without an address yet");
                continue;
            }
            if *shutdown.borrow() {
                break;
            }
            // Acquired before spawning so a single permit keeps name order.
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let reconciler = Arc::clone(self);
            let name = name.clone();
            let address = address.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let _permit = permit;
                reconciler
                    .reconcile_instance(&name, &address, &shutdown)
                    .await
            });
        }

        let mut reports = Vec::with_capacity(instances.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => error!("Instance task failed: {}", err),
            }
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    pub async fn reconcile_instance(
        &self,
        name: &str,
        address: &InstanceAddress,
        shutdown: &watch::Receiver<bool>,
    ) -> InstanceReport {
        let mut report = InstanceReport::new(name, address);
        if let Err(condition) = self.drive(name, address, &mut report, shutdown).await {
            self.settle(name, &condition, &mut report).await;
        }
        report
    }

    async fn drive(
        &self,
        name: &str,
        address: &InstanceAddress,
        report: &mut InstanceReport,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), ReconcileError> {
        let address = match address {
            InstanceAddress::Resolved(address) => address,
            InstanceAddress::Unresolvable(reason) => {
                debug!(instance = %name, "Unresolvable: {}", reason);
                return Err(ReconcileError::Unresolvable);
            }
            InstanceAddress::Pending => return Ok(()),
        };

        ensure_running(shutdown)?;
        let client = self
            .connector
            .connect(address, self.settings.vault.token.as_deref())
            .map_err(|source| ReconcileError::Connect {
                address: address.clone(),
                source,
            })?;
        let mut client = ClientHandle::new(client);

        let initialized = client
            .init_status()
            .await
            .map_err(ReconcileError::InitStatus)?;
        report.initialized = Some(initialized);

        let mut fresh_keys = None;
        if !initialized {
            ensure_running(shutdown)?;
            let material = self.initialize(name, &client).await?;
            report.initialized = Some(true);
            report.initialized_now = true;
            client.rebind(material.root.expose());
            fresh_keys = Some(material.unseal_keys);
        }

        ensure_running(shutdown)?;
        let status = client
            .seal_status()
            .await
            .map_err(ReconcileError::SealStatus)?;
        if status.sealed {
            report.seal = Some(SealState::Sealed);
            self.unseal(name, &client, status, fresh_keys, shutdown)
                .await?;
        }
        report.seal = Some(SealState::Unsealed);

        ensure_running(shutdown)?;
        match client.leader_status().await {
            Ok(status) => {
                let leader = LeaderState::from(&status);
                report.leader = Some(leader);
                debug!(instance = %name, "Leader state: {:?}", leader);
                Ok(())
            }
            Err(err) => {
                report.leader = Some(LeaderState::Unknown);
                Err(ReconcileError::LeaderStatus(err))
            }
        }
    }

    async fn initialize(
        &self,
        name: &str,
        client: &ClientHandle,
    ) -> Result<KeyMaterial, ReconcileError> {
        let mut unpersisted = self.unpersisted.lock().await;
        let vault = KeyVault::new(self.store.as_ref(), &self.settings);
        let init = self.settings.init;

        if unpersisted.is_some() {
            return Err(ReconcileError::AlreadyInitialized {
                location: format!("{} (write pending)", vault.unseal_location()),
            });
        }
        if UnsealKeySet::new(self.settings.unseal.keys.clone()).covers(init.threshold) {
            return Err(ReconcileError::AlreadyInitialized {
                location: "unseal.keys".to_string(),
            });
        }
        let stored = vault
            .load_unseal_keys()
            .await
            .map_err(ReconcileError::KeyLookup)?;
        if stored.covers(init.threshold) {
            return Err(ReconcileError::AlreadyInitialized {
                location: vault.unseal_location(),
            });
        }

        info!(
            instance = %name,
            "Initialising with {} shares, threshold {}", init.shares, init.threshold
        );
        let material = client
            .initialize(init.shares, init.threshold)
            .await
            .map_err(ReconcileError::Initialize)?;

        let wait = self.settings.init_wait();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        match vault.persist(&material).await {
            Ok(()) => info!(
                instance = %name,
                "Stored {} unseal keys and root token", material.unseal_keys.len()
            ),
            Err(err) => {
                error!(instance = %name, "{}", ReconcileError::PersistKeyMaterial(err));
                *unpersisted = Some(material.clone());
            }
        }
        Ok(material)
    }

    async fn unseal(
        &self,
        name: &str,
        client: &ClientHandle,
        mut status: SealStatus,
        fresh_keys: Option<UnsealKeySet>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), ReconcileError> {
        let keys = self.unseal_keys(fresh_keys).await?;
        let mut submitted = 0;
        for key in keys.iter() {
            ensure_running(shutdown)?;
            submitted += 1;
            match client.unseal(key).await {
                Ok(next) => {
                    status = next;
                    if !status.sealed {
                        info!(instance = %name, "Unsealed after {} share(s)", submitted);
                        return Ok(());
                    }
                }
                Err(err) => warn!(instance = %name, "Unseal share {} failed: {:#}", submitted, err),
            }
        }
        Err(ReconcileError::InsufficientKeys {
            submitted,
            progress: status.progress.unwrap_or_default(),
            threshold: status
                .t
                .unwrap_or_else(|| u32::from(self.settings.init.threshold)),
        })
    }

    /// Fresh shares from this tick's initialise, then configured shares, then
    /// shares awaiting a write, then the store.
    async fn unseal_keys(
        &self,
        fresh_keys: Option<UnsealKeySet>,
    ) -> Result<UnsealKeySet, ReconcileError> {
        if let Some(keys) = fresh_keys.filter(|keys| !keys.is_empty()) {
            return Ok(keys);
        }
        if !self.settings.unseal.keys.is_empty() {
            return Ok(UnsealKeySet::new(self.settings.unseal.keys.clone()));
        }
        if let Some(material) = self.unpersisted.lock().await.as_ref() {
            return Ok(material.unseal_keys.clone());
        }
        KeyVault::new(self.store.as_ref(), &self.settings)
            .load_unseal_keys()
            .await
            .map_err(ReconcileError::KeyLookup)
    }

    async fn settle(&self, name: &str, condition: &ReconcileError, report: &mut InstanceReport) {
        if condition.is_warning() {
            warn!(instance = %name, "{}", condition);
        } else {
            error!(instance = %name, "{}", condition);
        }
        report.condition = Some(condition.to_string());

        if !condition.requires_remediation() {
            return;
        }
        let Some(remediator) = &self.remediator else {
            debug!(instance = %name, "Not orchestrated; leaving instance in place");
            return;
        };
        match remediator
            .remove_instance(name, &self.settings.namespace)
            .await
        {
            Ok(true) => {
                warn!(instance = %name, "Removed unhealthy instance for replacement");
                report.remediated = true;
            }
            Ok(false) => debug!(instance = %name, "No workload to remove for instance"),
            Err(err) => error!(instance = %name, "Failed to remove instance: {:#}", err),
        }
    }

    async fn flush_unpersisted(&self) {
        let mut unpersisted = self.unpersisted.lock().await;
        let Some(material) = unpersisted.as_ref() else {
            return;
        };
        match KeyVault::new(self.store.as_ref(), &self.settings)
            .persist(material)
            .await
        {
            Ok(()) => {
                info!("Stored key material held since a failed write");
                *unpersisted = None;
            }
            Err(err) => error!("{}", ReconcileError::PersistKeyMaterial(err)),
        }
    }

    fn permits(&self) -> usize {
        usize::try_from(self.settings.daemon.max_concurrent_instances)
            .unwrap_or(Semaphore::MAX_PERMITS)
            .clamp(1, Semaphore::MAX_PERMITS)
    }
}

fn ensure_running(shutdown: &watch::Receiver<bool>) -> Result<(), ReconcileError> {
    if *shutdown.borrow() {
        return Err(ReconcileError::Cancelled);
    }
    Ok(())
}
