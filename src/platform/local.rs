use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::SecretStore;
use crate::fs_util;

/// File-backed secret store used when the controller runs off-cluster.
///
/// `put(name, key, value, namespace)` lands in `<root>/<namespace>/<name>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalSecretStore {
    root: PathBuf,
}

impl LocalSecretStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str, key: &str, namespace: &str) -> Result<PathBuf> {
        for segment in [namespace, name, key] {
            ensure_plain_segment(segment)?;
        }
        Ok(self.root.join(namespace).join(name).join(key))
    }
}

#[async_trait]
impl SecretStore for LocalSecretStore {
    async fn get(&self, name: &str, key: &str, namespace: &str) -> Result<Option<String>> {
        let path = self.path_for(name, key, namespace)?;
        fs_util::read_secret_file(&path).await
    }

    async fn put(&self, name: &str, key: &str, value: &str, namespace: &str) -> Result<()> {
        let path = self.path_for(name, key, namespace)?;
        fs_util::write_secret_file(&path, value).await?;
        debug!("Stored secret {}/{}:{} on disk", namespace, name, key);
        Ok(())
    }
}

fn ensure_plain_segment(segment: &str) -> Result<()> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => anyhow::bail!("Invalid secret path segment: {segment:?}"),
    }
}
