//! Resolves the set of instances to reconcile on each tick.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::platform::PodDirectory;

/// Instance name to address, iterated in name order.
pub type InstanceMap = BTreeMap<String, InstanceAddress>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceAddress {
    /// `scheme://ip:port`
    Resolved(String),
    /// Known instance without a usable address; remediated when orchestrated.
    Unresolvable(String),
    /// Known instance not yet addressable (e.g. pod not scheduled); skipped.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEndpoint {
    pub name: String,
    pub state: EndpointState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointState {
    Ready(IpAddr),
    Failing(String),
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Fixed host list
    Static(Vec<String>),
    /// Pods matching a label selector
    Label(String),
}

impl DiscoveryMode {
    /// Picks the discovery mode: the static list wins, pod discovery needs
    /// orchestration.
    ///
    /// # Errors
    /// Returns an error when neither mode is available.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        if !settings.discovery.instances.is_empty() {
            return Ok(Self::Static(settings.discovery.instances.clone()));
        }
        if settings.orchestrated {
            return Ok(Self::Label(label_selector(&settings.discovery.label)));
        }
        anyhow::bail!(
            "No discovery mode available: set discovery.instances (VAULT_INSTANCES) or run under Kubernetes"
        )
    }
}

/// Bare values select on `app`; anything containing `=` is used verbatim.
#[must_use]
pub fn label_selector(label: &str) -> String {
    let label = label.trim();
    if label.contains('=') {
        label.to_string()
    } else {
        format!("app={label}")
    }
}

#[must_use]
pub fn format_address(scheme: &str, ip: IpAddr, port: u16) -> String {
    format!("{scheme}://{}", SocketAddr::new(ip, port))
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<IpAddr>;
}

/// Resolves through the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let mut addrs = tokio::net::lookup_host((host, 0))
            .await
            .with_context(|| format!("Failed to resolve {host}"))?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| anyhow::anyhow!("No addresses found for {host}"))
    }
}

pub struct Directory {
    namespace: String,
    scheme: String,
    port: u16,
    resolver: Arc<dyn HostResolver>,
    pods: Option<Arc<dyn PodDirectory>>,
}

impl Directory {
    #[must_use]
    pub fn new(
        settings: &Settings,
        resolver: Arc<dyn HostResolver>,
        pods: Option<Arc<dyn PodDirectory>>,
    ) -> Self {
        Self {
            namespace: settings.namespace.clone(),
            scheme: settings.vault.scheme.clone(),
            port: settings.vault.port,
            resolver,
            pods,
        }
    }

    /// Produces the instance map for this tick.
    ///
    /// # Errors
    /// Returns an error if pod discovery is requested without a platform or
    /// the pod listing fails. Per-host resolution failures are not errors.
    pub async fn discover(&self, mode: &DiscoveryMode) -> Result<InstanceMap> {
        let mut instances = InstanceMap::new();
        match mode {
            DiscoveryMode::Static(hosts) => {
                for host in hosts {
                    let address = self.resolve_host(host).await;
                    instances.insert(host.clone(), address);
                }
            }
            DiscoveryMode::Label(selector) => {
                let pods = self
                    .pods
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("Pod discovery requires Kubernetes"))?;
                for pod in pods.pod_endpoints(selector, &self.namespace).await? {
                    let address = match pod.state {
                        EndpointState::Ready(ip) => {
                            InstanceAddress::Resolved(format_address(&self.scheme, ip, self.port))
                        }
                        EndpointState::Failing(reason) => InstanceAddress::Unresolvable(reason),
                        EndpointState::Pending => InstanceAddress::Pending,
                    };
                    instances.insert(pod.name, address);
                }
            }
        }
        debug!("Discovered {} instance(s)", instances.len());
        Ok(instances)
    }

    async fn resolve_host(&self, host: &str) -> InstanceAddress {
        let host = host.trim();
        if host.is_empty() {
            return InstanceAddress::Pending;
        }
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return InstanceAddress::Resolved(format_address(&self.scheme, ip, self.port));
        }
        match self.resolver.resolve(host).await {
            Ok(ip) => InstanceAddress::Resolved(format_address(&self.scheme, ip, self.port)),
            Err(err) => {
                warn!("Failed to resolve instance {}: {:#}", host, err);
                InstanceAddress::Unresolvable(format!("{err:#}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct FixedResolver(HashMap<&'static str, IpAddr>);

    #[async_trait]
    impl HostResolver for FixedResolver {
        async fn resolve(&self, host: &str) -> Result<IpAddr> {
            self.0
                .get(host)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no such host"))
        }
    }

    struct FixedPods(Vec<PodEndpoint>);

    #[async_trait]
    impl PodDirectory for FixedPods {
        async fn pod_endpoints(&self, selector: &str, namespace: &str) -> Result<Vec<PodEndpoint>> {
            assert_eq!(selector, "app=vault");
            assert_eq!(namespace, "kube-system");
            Ok(self.0.clone())
        }
    }

    fn settings() -> Settings {
        Settings::new(None).unwrap()
    }

    fn resolver() -> Arc<dyn HostResolver> {
        Arc::new(FixedResolver(HashMap::from([(
            "a",
            "10.0.0.1".parse().unwrap(),
        )])))
    }

    #[tokio::test]
    async fn test_static_discovery_marks_unresolvable_hosts() {
        let directory = Directory::new(&settings(), resolver(), None);
        let mode = DiscoveryMode::Static(vec!["a".into(), "b".into()]);

        let instances = directory.discover(&mode).await.unwrap();

        assert_eq!(
            instances.get("a"),
            Some(&InstanceAddress::Resolved("https://10.0.0.1:8243".into()))
        );
        assert!(matches!(
            instances.get("b"),
            Some(InstanceAddress::Unresolvable(_))
        ));
    }

    #[tokio::test]
    async fn test_static_discovery_accepts_ip_literals() {
        let mut settings = settings();
        settings.vault.scheme = "http".into();
        settings.vault.port = 8200;
        let directory = Directory::new(&settings, resolver(), None);
        let mode = DiscoveryMode::Static(vec!["192.168.1.5".into(), "[fd00::1]".into()]);

        let instances = directory.discover(&mode).await.unwrap();

        assert_eq!(
            instances.get("192.168.1.5"),
            Some(&InstanceAddress::Resolved("http://192.168.1.5:8200".into()))
        );
        assert_eq!(
            instances.get("[fd00::1]"),
            Some(&InstanceAddress::Resolved("http://[fd00::1]:8200".into()))
        );
    }

    #[tokio::test]
    async fn test_pod_discovery_classifies_pods() {
        let pods = FixedPods(vec![
            PodEndpoint {
                name: "vault-0".into(),
                state: EndpointState::Ready("10.1.0.7".parse().unwrap()),
            },
            PodEndpoint {
                name: "vault-1".into(),
                state: EndpointState::Failing("CrashLoopBackOff".into()),
            },
            PodEndpoint {
                name: "vault-2".into(),
                state: EndpointState::Pending,
            },
        ]);
        let directory = Directory::new(&settings(), resolver(), Some(Arc::new(pods)));

        let instances = directory
            .discover(&DiscoveryMode::Label("app=vault".into()))
            .await
            .unwrap();

        assert_eq!(instances.len(), 3);
        assert_eq!(
            instances.get("vault-0"),
            Some(&InstanceAddress::Resolved("https://10.1.0.7:8243".into()))
        );
        assert!(matches!(
            instances.get("vault-1"),
            Some(InstanceAddress::Unresolvable(_))
        ));
        assert_eq!(instances.get("vault-2"), Some(&InstanceAddress::Pending));
    }

    #[tokio::test]
    async fn test_pod_discovery_without_platform_fails() {
        let directory = Directory::new(&settings(), resolver(), None);

        let err = directory
            .discover(&DiscoveryMode::Label("app=vault".into()))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("requires Kubernetes"));
    }

    #[test]
    fn test_mode_selection() {
        let mut settings = settings();
        assert!(DiscoveryMode::from_settings(&settings).is_err());

        settings.orchestrated = true;
        assert_eq!(
            DiscoveryMode::from_settings(&settings).unwrap(),
            DiscoveryMode::Label("app=vault".into())
        );

        settings.discovery.instances = vec!["vault-0.local".into()];
        assert_eq!(
            DiscoveryMode::from_settings(&settings).unwrap(),
            DiscoveryMode::Static(vec!["vault-0.local".into()])
        );
    }

    #[test]
    fn test_label_selector() {
        assert_eq!(label_selector("vault"), "app=vault");
        assert_eq!(
            label_selector("app.kubernetes.io/name=vault"),
            "app.kubernetes.io/name=vault"
        );
    }
}
