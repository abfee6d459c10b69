//! Unseal key shares and the root credential, and how they reach the store.

use std::fmt;

use anyhow::{Context, Result};

use crate::config::{SecretLocation, Settings};
use crate::platform::SecretStore;
use crate::vault::InitResponse;

const KEY_SEPARATOR: char = ',';

/// Ordered key shares, stored as one comma-joined value.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct UnsealKeySet(Vec<String>);

impl fmt::Debug for UnsealKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnsealKeySet({} shares)", self.0.len())
    }
}

impl UnsealKeySet {
    #[must_use]
    pub fn new(keys: Vec<String>) -> Self {
        Self(
            keys.into_iter()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect(),
        )
    }

    #[must_use]
    pub fn parse(joined: &str) -> Self {
        Self::new(joined.split(KEY_SEPARATOR).map(str::to_string).collect())
    }

    #[must_use]
    pub fn joined(&self) -> String {
        self.0.join(&KEY_SEPARATOR.to_string())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether enough shares exist to prove the cluster was initialised.
    #[must_use]
    pub fn covers(&self, threshold: u8) -> bool {
        threshold > 0 && self.0.len() >= usize::from(threshold)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RootCredential(String);

impl fmt::Debug for RootCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootCredential(<redacted>)")
    }
}

impl RootCredential {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

/// Output of a successful initialise: persisted as a unit.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub unseal_keys: UnsealKeySet,
    pub root: RootCredential,
}

impl From<InitResponse> for KeyMaterial {
    fn from(response: InitResponse) -> Self {
        // Older servers only return the base64 form.
        let keys = if response.keys.is_empty() {
            response.keys_base64
        } else {
            response.keys
        };
        Self {
            unseal_keys: UnsealKeySet::new(keys),
            root: RootCredential::new(response.root_token),
        }
    }
}

/// Secret store view scoped to the controller's namespace and locations.
#[derive(Clone, Copy)]
pub struct KeyVault<'a> {
    store: &'a dyn SecretStore,
    settings: &'a Settings,
}

impl<'a> KeyVault<'a> {
    #[must_use]
    pub fn new(store: &'a dyn SecretStore, settings: &'a Settings) -> Self {
        Self { store, settings }
    }

    /// Human-readable location of the stored key shares.
    #[must_use]
    pub fn unseal_location(&self) -> String {
        describe(&self.settings.namespace, &self.settings.unseal.location())
    }

    /// Loads the stored key shares; empty when nothing is stored.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn load_unseal_keys(&self) -> Result<UnsealKeySet> {
        let location = self.settings.unseal.location();
        let stored = self
            .store
            .get(
                &location.secret_name,
                &location.secret_key,
                &self.settings.namespace,
            )
            .await
            .with_context(|| format!("Failed to read {}", self.unseal_location()))?;
        Ok(stored.as_deref().map(UnsealKeySet::parse).unwrap_or_default())
    }

    /// Loads the stored root credential, if any.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn load_root(&self) -> Result<Option<RootCredential>> {
        let location = &self.settings.root_token;
        let stored = self
            .store
            .get(
                &location.secret_name,
                &location.secret_key,
                &self.settings.namespace,
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to read {}",
                    describe(&self.settings.namespace, location)
                )
            })?;
        Ok(stored
            .filter(|token| !token.trim().is_empty())
            .map(RootCredential::new))
    }

    /// Writes the key shares and the root credential.
    ///
    /// Both writes are attempted; the material counts as persisted only when
    /// both succeed, so a caller retrying on error rewrites both.
    ///
    /// # Errors
    /// Returns an error naming every write that failed.
    pub async fn persist(&self, material: &KeyMaterial) -> Result<()> {
        let namespace = &self.settings.namespace;
        let unseal = self.settings.unseal.location();
        let root = &self.settings.root_token;

        let keys_written = self
            .store
            .put(
                &unseal.secret_name,
                &unseal.secret_key,
                &material.unseal_keys.joined(),
                namespace,
            )
            .await;
        let root_written = self
            .store
            .put(
                &root.secret_name,
                &root.secret_key,
                material.root.expose(),
                namespace,
            )
            .await;

        match (keys_written, root_written) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) => {
                Err(err).with_context(|| format!("Failed to write {}", describe(namespace, &unseal)))
            }
            (Ok(()), Err(err)) => {
                Err(err).with_context(|| format!("Failed to write {}", describe(namespace, root)))
            }
            (Err(keys_err), Err(root_err)) => Err(anyhow::anyhow!(
                "Failed to write {} ({keys_err:#}) and {} ({root_err:#})",
                describe(namespace, &unseal),
                describe(namespace, root)
            )),
        }
    }
}

fn describe(namespace: &str, location: &SecretLocation) -> String {
    format!(
        "{namespace}/{}:{}",
        location.secret_name, location.secret_key
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// In-memory secret store shared by reconciler and policy tests.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub values: Mutex<HashMap<(String, String, String), String>>,
        pub failing_names: Mutex<Vec<String>>,
        pub fail_reads: Mutex<bool>,
        pub puts: Mutex<Vec<(String, String)>>,
    }

    impl MemoryStore {
        pub(crate) fn insert(&self, name: &str, key: &str, namespace: &str, value: &str) {
            self.values.lock().unwrap().insert(
                (namespace.to_string(), name.to_string(), key.to_string()),
                value.to_string(),
            );
        }

        pub(crate) fn value(&self, name: &str, key: &str, namespace: &str) -> Option<String> {
            self.values
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string(), key.to_string()))
                .cloned()
        }

        pub(crate) fn fail_writes_to(&self, name: &str) {
            self.failing_names.lock().unwrap().push(name.to_string());
        }

        pub(crate) fn heal(&self) {
            self.failing_names.lock().unwrap().clear();
            *self.fail_reads.lock().unwrap() = false;
        }
    }

    #[async_trait]
    impl SecretStore for MemoryStore {
        async fn get(&self, name: &str, key: &str, namespace: &str) -> Result<Option<String>> {
            if *self.fail_reads.lock().unwrap() {
                anyhow::bail!("store unavailable");
            }
            Ok(self.value(name, key, namespace))
        }

        async fn put(&self, name: &str, key: &str, value: &str, namespace: &str) -> Result<()> {
            if self.failing_names.lock().unwrap().iter().any(|n| n == name) {
                anyhow::bail!("write rejected");
            }
            self.puts
                .lock()
                .unwrap()
                .push((name.to_string(), key.to_string()));
            self.insert(name, key, namespace, value);
            Ok(())
        }
    }

    fn settings() -> Settings {
        Settings::new(None).unwrap()
    }

    fn material() -> KeyMaterial {
        KeyMaterial {
            unseal_keys: UnsealKeySet::new(vec!["k1".into(), "k2".into(), "k3".into()]),
            root: RootCredential::new("s.root"),
        }
    }

    #[test]
    fn test_key_set_parse_drops_blanks() {
        let keys = UnsealKeySet::parse(" k1, ,k2,");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.joined(), "k1,k2");
        assert!(keys.covers(2));
        assert!(!keys.covers(3));
        assert!(!UnsealKeySet::default().covers(0));
    }

    #[test]
    fn test_debug_never_shows_material() {
        let rendered = format!("{:?}", material());
        assert!(!rendered.contains("k1"));
        assert!(!rendered.contains("s.root"));
        assert!(rendered.contains("3 shares"));
    }

    #[test]
    fn test_material_falls_back_to_base64_keys() {
        let material = KeyMaterial::from(InitResponse {
            keys: Vec::new(),
            keys_base64: vec!["b1".into(), "b2".into()],
            root_token: "s.root".into(),
        });
        assert_eq!(material.unseal_keys.joined(), "b1,b2");
    }

    #[tokio::test]
    async fn test_persist_writes_keys_and_root_together() {
        let store = MemoryStore::default();
        let settings = settings();
        let vault = KeyVault::new(&store, &settings);

        vault.persist(&material()).await.unwrap();

        assert_eq!(
            store
                .value("vault-unseal-keys", "unseal-keys", "kube-system")
                .as_deref(),
            Some("k1,k2,k3")
        );
        assert_eq!(
            vault.load_root().await.unwrap().map(|r| r.expose().to_string()),
            Some("s.root".to_string())
        );
        assert_eq!(vault.load_unseal_keys().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_persist_reports_partial_failure() {
        let store = MemoryStore::default();
        store.fail_writes_to("vault-tokens");
        let settings = settings();

        let err = KeyVault::new(&store, &settings)
            .persist(&material())
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("kube-system/vault-tokens:root-token"));
    }

    #[tokio::test]
    async fn test_load_unseal_keys_empty_when_absent() {
        let store = MemoryStore::default();
        let settings = settings();

        let keys = KeyVault::new(&store, &settings)
            .load_unseal_keys()
            .await
            .unwrap();

        assert!(keys.is_empty());
    }
}
