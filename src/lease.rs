//! Exclusive leases on page blobs
//!
//! A mounted device holds an infinite lease on its blob. The lease is the
//! only mutual exclusion between hosts racing to mount the same blob.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::AccessMode;
use crate::error::{DyskError, Result};
use crate::store::{BlobProperties, BlobRef, BlobStore, BlobType, LeaseDuration};

/// Metadata written by the writability probe
pub const PROBE_METADATA_KEY: &str = "dysk";
pub const PROBE_METADATA_VALUE: &str = "dysk";

/// A best-effort cleanup step that failed without failing its operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    pub action: String,
    pub target: String,
    pub error: String,
}

impl CleanupWarning {
    pub fn new(action: impl Into<String>, target: impl fmt::Display, error: &DyskError) -> Self {
        Self {
            action: action.into(),
            target: target.to_string(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} failed: {}", self.action, self.target, self.error)
    }
}

/// Result of an operation whose cleanup steps may have failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<CleanupWarning>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn push_warning(&mut self, warning: Option<CleanupWarning>) {
        if let Some(warning) = warning {
            self.warnings.push(warning);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Lease operations against one store
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn BlobStore>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Acquire an infinite lease.
    ///
    /// When the blob is already leased and `break_existing` is set, the
    /// existing lease is broken immediately and acquisition is retried once.
    pub async fn acquire(&self, blob: &BlobRef, break_existing: bool) -> Result<String> {
        match self.store.acquire_lease(blob, LeaseDuration::Infinite).await {
            Ok(lease_id) => {
                debug!(blob = %blob, "acquired lease");
                Ok(lease_id)
            }
            Err(DyskError::LeaseAlreadyPresent(_)) if break_existing => {
                debug!(blob = %blob, "lease present, breaking and retrying");
                self.store.break_lease(blob, 0).await?;
                self.store.acquire_lease(blob, LeaseDuration::Infinite).await
            }
            Err(e) => Err(e),
        }
    }

    /// Prove the lease is live, and for read-write access that it permits writes.
    ///
    /// Properties are read under the lease. Read-write records additionally
    /// rewrite the blob's metadata under the lease, which fails unless the
    /// lease is the one currently held.
    pub async fn verify_writable(
        &self,
        blob: &BlobRef,
        lease_id: &str,
        mode: AccessMode,
    ) -> Result<BlobProperties> {
        let properties = self.store.properties(blob, Some(lease_id)).await?;
        if properties.blob_type != Some(BlobType::Page) {
            return Err(DyskError::Validation(
                "This blob is not a page blob".to_string(),
            ));
        }

        if mode == AccessMode::ReadWrite {
            let mut metadata = properties.metadata.clone();
            metadata.insert(
                PROBE_METADATA_KEY.to_string(),
                PROBE_METADATA_VALUE.to_string(),
            );
            self.store
                .set_metadata(blob, &metadata, Some(lease_id))
                .await?;
        }
        Ok(properties)
    }

    /// Break the current lease immediately
    pub async fn break_lease(&self, blob: &BlobRef) -> Result<()> {
        self.store.break_lease(blob, 0).await
    }

    /// Break the current lease, reporting failure as a warning
    pub async fn break_best_effort(&self, blob: &BlobRef) -> Option<CleanupWarning> {
        match self.break_lease(blob).await {
            Ok(()) => {
                debug!(blob = %blob, "broke lease");
                None
            }
            Err(e) => {
                warn!(blob = %blob, error = %e, "lease break failed");
                Some(CleanupWarning::new("break lease on", blob, &e))
            }
        }
    }

    /// Check the container and blob exist and return the blob's properties
    pub async fn locate(&self, blob: &BlobRef) -> Result<BlobProperties> {
        let container_path = format!("/{}", blob.container);
        if !self.store.container_exists(&blob.container).await? {
            return Err(DyskError::NotFound(format!(
                "Container at {} does not exist",
                container_path
            )));
        }
        if !self.store.blob_exists(blob).await? {
            return Err(DyskError::NotFound(format!(
                "Blob at {} does not exist",
                blob
            )));
        }
        self.store.properties(blob, None).await
    }
}
