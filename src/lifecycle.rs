//! Page blob creation and deletion

use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::error::Result;
use crate::lease::{LeaseManager, Outcome};
use crate::size;
use crate::store::{BlobRef, BlobStore, ByteRange};
use crate::vhd;

/// Name suffix of blobs carrying a VHD footer
pub const VHD_SUFFIX: &str = ".vhd";

/// Blob name for `name`, with the VHD suffix appended when a trailer is used
pub fn object_name_for(name: &str, trailer: bool) -> String {
    if trailer && !name.ends_with(VHD_SUFFIX) {
        format!("{}{}", name, VHD_SUFFIX)
    } else {
        name.to_string()
    }
}

/// A newly provisioned blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedObject {
    pub blob: BlobRef,
    pub size_gb: u64,
    pub trailer: bool,
    pub lease_id: Option<String>,
}

/// Creates and deletes device blobs
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn BlobStore>,
    leases: LeaseManager,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            leases: LeaseManager::new(store.clone()),
            store,
        }
    }

    /// Provision a page blob of `size_gb` GiB.
    ///
    /// With `trailer`, a VHD footer describing the payload is written to the
    /// last 512 bytes and the name gets the `.vhd` suffix. With `lease`, an
    /// infinite lease is taken on the new blob.
    pub async fn create_object(
        &self,
        size_gb: u64,
        container: &str,
        name: &str,
        trailer: bool,
        lease: bool,
    ) -> Result<CreatedObject> {
        size::check_size_gb(size_gb)?;

        let blob = BlobRef::new(container, object_name_for(name, trailer));
        let object_size = size::object_bytes(size_gb)?;

        self.store.create_container_if_absent(container).await?;
        self.store.create_page_blob(&blob, object_size).await?;

        if trailer {
            let footer = vhd::fixed_footer(size::payload_bytes(size_gb, true)?);
            let range = ByteRange::tail(object_size, size::TRAILER_SIZE);
            self.store
                .write_range(&blob, range, Bytes::copy_from_slice(&footer), None)
                .await?;
        }

        let lease_id = if lease {
            Some(self.leases.acquire(&blob, false).await?)
        } else {
            None
        };

        info!(blob = %blob, size_gb, trailer, leased = lease_id.is_some(), "created page blob");
        Ok(CreatedObject {
            blob,
            size_gb,
            trailer,
            lease_id,
        })
    }

    /// Delete a blob.
    ///
    /// Without `force_break` the delete runs under `lease_id`. With it, any
    /// lease is broken first; a failed break is reported as a warning and the
    /// delete proceeds without a lease id.
    pub async fn delete_object(
        &self,
        blob: &BlobRef,
        lease_id: Option<&str>,
        force_break: bool,
    ) -> Result<Outcome<()>> {
        let mut outcome = Outcome::new(());

        if force_break {
            outcome.push_warning(self.leases.break_best_effort(blob).await);
            self.store.delete_blob(blob, None).await?;
        } else {
            self.store.delete_blob(blob, lease_id).await?;
        }

        info!(blob = %blob, "deleted page blob");
        Ok(outcome)
    }
}
