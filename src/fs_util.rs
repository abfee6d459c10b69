use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;

const SECRET_FILE_MODE: u32 = 0o600;
const SECRETS_DIR_MODE: u32 = 0o700;

/// Ensures the secrets directory exists and has secure permissions.
///
/// # Errors
/// Returns an error if the directory cannot be created or permissions cannot be set.
pub async fn ensure_secrets_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create secrets dir {}", path.display()))?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(SECRETS_DIR_MODE))
        .await
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Writes a secret value, replacing any previous content, readable by the
/// owner only.
///
/// # Errors
/// Returns an error if the parent directory cannot be prepared or the file
/// cannot be written.
pub async fn write_secret_file(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Secret path has no parent directory"))?;
    ensure_secrets_dir(dir).await?;

    // Stage next to the target so the rename stays on one filesystem.
    let staging = path.with_extension("tmp");
    fs::write(&staging, contents)
        .await
        .with_context(|| format!("Failed to write {}", staging.display()))?;
    fs::set_permissions(&staging, std::fs::Permissions::from_mode(SECRET_FILE_MODE))
        .await
        .with_context(|| format!("Failed to set permissions on {}", staging.display()))?;
    fs::rename(&staging, path)
        .await
        .with_context(|| format!("Failed to move secret into {}", path.display()))?;
    Ok(())
}

/// Reads a secret value; `Ok(None)` if the file does not exist.
///
/// # Errors
/// Returns an error for any I/O failure other than a missing file.
pub async fn read_secret_file(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}
