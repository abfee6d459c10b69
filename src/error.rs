//! Conditions reported by the instance reconciler.

use thiserror::Error;

/// Why an instance's reconciliation stopped short for the current tick.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// Discovery produced the error sentinel for this instance
    #[error("instance address could not be resolved")]
    Unresolvable,

    /// A client for the instance address could not be built
    #[error("failed to build client for {address}: {source:#}")]
    Connect {
        address: String,
        source: anyhow::Error,
    },

    /// `sys/init` could not be queried
    #[error("init state unknown: {0:#}")]
    InitStatus(anyhow::Error),

    /// Stored key material already covers the threshold
    #[error("instance already initialised: existing unseal keys found in {location}")]
    AlreadyInitialized { location: String },

    /// The secret store could not be read before initialising
    #[error("unseal key lookup failed: {0:#}")]
    KeyLookup(anyhow::Error),

    /// The initialise call itself failed
    #[error("initialise failed: {0:#}")]
    Initialize(anyhow::Error),

    /// Fresh key material could not be written to the secret store
    #[error("failed to persist key material: {0:#}")]
    PersistKeyMaterial(anyhow::Error),

    /// `sys/seal-status` could not be queried
    #[error("seal state unknown: {0:#}")]
    SealStatus(anyhow::Error),

    /// Every known share was submitted and the instance is still sealed
    #[error(
        "insufficient unseal keys: submitted {submitted}, progress {progress}/{threshold}, instance sealed"
    )]
    InsufficientKeys {
        submitted: usize,
        progress: u32,
        threshold: u32,
    },

    /// `sys/leader` could not be queried
    #[error("leader state unknown: {0:#}")]
    LeaderStatus(anyhow::Error),

    /// Shutdown was requested while the instance was being processed
    #[error("reconciliation cancelled by shutdown")]
    Cancelled,
}

impl ReconcileError {
    /// Whether the platform should replace the instance when orchestrated.
    #[must_use]
    pub fn requires_remediation(&self) -> bool {
        matches!(
            self,
            Self::Unresolvable
                | Self::Connect { .. }
                | Self::InitStatus(_)
                | Self::SealStatus(_)
                | Self::LeaderStatus(_)
        )
    }

    /// Conditions that are expected operational states rather than failures.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::AlreadyInitialized { .. } | Self::Cancelled)
    }
}
