//! In-memory blob store
//!
//! Keeps page blobs in process with the same lease rules as the service.
//! Pages are stored sparsely: only written ranges are kept, everything else
//! reads back as zeros, so multi-gigabyte blobs cost nothing until written.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{DyskError, Result};
use crate::size::SECTOR_SIZE;
use crate::store::{
    BlobProperties, BlobRef, BlobStore, BlobType, ByteRange, LeaseDuration, LeaseState,
    StoreConnector,
};

/// Call counters, for asserting on side effects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub acquire_calls: u64,
    pub break_calls: u64,
    pub metadata_writes: u64,
    pub page_writes: u64,
    pub deletes: u64,
}

#[derive(Debug)]
struct StoredBlob {
    size: u64,
    blob_type: BlobType,
    /// Written ranges in write order; later writes win
    writes: Vec<(ByteRange, Bytes)>,
    metadata: BTreeMap<String, String>,
    lease_id: Option<String>,
    lease_state: LeaseState,
}

impl StoredBlob {
    fn new(size: u64, blob_type: BlobType) -> Self {
        Self {
            size,
            blob_type,
            writes: Vec::new(),
            metadata: BTreeMap::new(),
            lease_id: None,
            lease_state: LeaseState::Available,
        }
    }

    /// Lease check for operations that modify the blob
    fn check_write_lease(&self, blob: &BlobRef, lease_id: Option<&str>) -> Result<()> {
        let given = lease_id.filter(|l| !l.is_empty());
        match (&self.lease_id, given) {
            (Some(_), None) => Err(DyskError::LeaseMismatch(format!(
                "There is currently a lease on {} and no lease ID was specified",
                blob
            ))),
            (Some(held), Some(given)) if held != given => Err(DyskError::LeaseMismatch(format!(
                "The lease ID specified did not match the lease ID for {}",
                blob
            ))),
            (None, Some(_)) => Err(DyskError::LeaseMismatch(format!(
                "There is currently no lease on {}",
                blob
            ))),
            _ => Ok(()),
        }
    }

    /// Lease check for reads: a lease id is optional but must match if given
    fn check_read_lease(&self, blob: &BlobRef, lease_id: Option<&str>) -> Result<()> {
        match lease_id.filter(|l| !l.is_empty()) {
            None => Ok(()),
            Some(_) => self.check_write_lease(blob, lease_id),
        }
    }
}

/// Blob store held entirely in memory
#[derive(Debug)]
pub struct MemoryBlobStore {
    account: String,
    containers: DashSet<String>,
    blobs: DashMap<BlobRef, StoredBlob>,
    stats: Mutex<StoreStats>,
}

impl MemoryBlobStore {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            containers: DashSet::new(),
            blobs: DashMap::new(),
            stats: Mutex::new(StoreStats::default()),
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    /// Insert a block blob, which cannot back a device
    pub fn insert_block_blob(&self, blob: &BlobRef, size: u64) {
        self.containers.insert(blob.container.clone());
        self.blobs
            .insert(blob.clone(), StoredBlob::new(size, BlobType::Block));
    }

    pub fn lease_state(&self, blob: &BlobRef) -> Option<LeaseState> {
        self.blobs.get(blob).map(|b| b.lease_state)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    fn not_found(blob: &BlobRef) -> DyskError {
        DyskError::NotFound(format!("The specified blob {} does not exist", blob))
    }

    fn check_alignment(range: ByteRange, size: u64) -> Result<()> {
        if range.is_empty()
            || range.start % SECTOR_SIZE != 0
            || range.len() % SECTOR_SIZE != 0
            || range.end >= size
        {
            return Err(DyskError::Backend(format!(
                "Invalid page range bytes={}-{} for blob of {} bytes",
                range.start, range.end, size
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn account(&self) -> &str {
        &self.account
    }

    async fn create_container_if_absent(&self, container: &str) -> Result<bool> {
        Ok(self.containers.insert(container.to_string()))
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        Ok(self.containers.contains(container))
    }

    async fn blob_exists(&self, blob: &BlobRef) -> Result<bool> {
        Ok(self.blobs.contains_key(blob))
    }

    async fn create_page_blob(&self, blob: &BlobRef, size: u64) -> Result<()> {
        if !self.containers.contains(&blob.container) {
            return Err(DyskError::NotFound(format!(
                "The specified container {} does not exist",
                blob.container
            )));
        }
        if size % SECTOR_SIZE != 0 {
            return Err(DyskError::Backend(format!(
                "Page blob size {} is not a multiple of {}",
                size, SECTOR_SIZE
            )));
        }
        if let Some(existing) = self.blobs.get(blob) {
            existing.check_write_lease(blob, None)?;
        }

        trace!(blob = %blob, size, "memory create page blob");
        self.blobs
            .insert(blob.clone(), StoredBlob::new(size, BlobType::Page));
        Ok(())
    }

    async fn write_range(
        &self,
        blob: &BlobRef,
        range: ByteRange,
        data: Bytes,
        lease_id: Option<&str>,
    ) -> Result<()> {
        let mut stored = self.blobs.get_mut(blob).ok_or_else(|| Self::not_found(blob))?;
        stored.check_write_lease(blob, lease_id)?;
        Self::check_alignment(range, stored.size)?;
        if data.len() as u64 != range.len() {
            return Err(DyskError::Backend(format!(
                "write of {} bytes does not fill range of {}",
                data.len(),
                range.len()
            )));
        }

        stored.writes.push((range, data));
        self.stats.lock().page_writes += 1;
        Ok(())
    }

    async fn read_range(
        &self,
        blob: &BlobRef,
        range: ByteRange,
        lease_id: Option<&str>,
    ) -> Result<Bytes> {
        let stored = self.blobs.get(blob).ok_or_else(|| Self::not_found(blob))?;
        stored.check_read_lease(blob, lease_id)?;
        if range.is_empty() || range.end >= stored.size {
            return Err(DyskError::Backend(format!(
                "Invalid range bytes={}-{} for blob of {} bytes",
                range.start, range.end, stored.size
            )));
        }

        let mut out = vec![0u8; range.len() as usize];
        for (written, data) in &stored.writes {
            let start = written.start.max(range.start);
            let end = written.end.min(range.end);
            if start > end {
                continue;
            }
            let src = (start - written.start) as usize..(end - written.start + 1) as usize;
            let dst = (start - range.start) as usize..(end - range.start + 1) as usize;
            out[dst].copy_from_slice(&data[src]);
        }
        Ok(Bytes::from(out))
    }

    async fn properties(&self, blob: &BlobRef, lease_id: Option<&str>) -> Result<BlobProperties> {
        let stored = self.blobs.get(blob).ok_or_else(|| Self::not_found(blob))?;
        stored.check_read_lease(blob, lease_id)?;
        Ok(BlobProperties {
            content_length: stored.size,
            blob_type: Some(stored.blob_type),
            lease_state: stored.lease_state,
            metadata: stored.metadata.clone(),
        })
    }

    async fn set_metadata(
        &self,
        blob: &BlobRef,
        metadata: &BTreeMap<String, String>,
        lease_id: Option<&str>,
    ) -> Result<()> {
        let mut stored = self.blobs.get_mut(blob).ok_or_else(|| Self::not_found(blob))?;
        stored.check_write_lease(blob, lease_id)?;
        stored.metadata = metadata.clone();
        self.stats.lock().metadata_writes += 1;
        Ok(())
    }

    async fn acquire_lease(&self, blob: &BlobRef, _duration: LeaseDuration) -> Result<String> {
        self.stats.lock().acquire_calls += 1;

        let mut stored = self.blobs.get_mut(blob).ok_or_else(|| Self::not_found(blob))?;
        if stored.lease_id.is_some() {
            return Err(DyskError::LeaseAlreadyPresent(format!(
                "There is already a lease present on {}",
                blob
            )));
        }

        let lease_id = uuid::Uuid::new_v4().to_string();
        stored.lease_id = Some(lease_id.clone());
        stored.lease_state = LeaseState::Leased;
        Ok(lease_id)
    }

    async fn break_lease(&self, blob: &BlobRef, _break_period_secs: u32) -> Result<()> {
        self.stats.lock().break_calls += 1;

        let mut stored = self.blobs.get_mut(blob).ok_or_else(|| Self::not_found(blob))?;
        if stored.lease_id.is_none() {
            return Err(DyskError::Backend(format!(
                "There is currently no lease on {}",
                blob
            )));
        }
        stored.lease_id = None;
        stored.lease_state = LeaseState::Broken;
        Ok(())
    }

    async fn delete_blob(&self, blob: &BlobRef, lease_id: Option<&str>) -> Result<()> {
        {
            let stored = self.blobs.get(blob).ok_or_else(|| Self::not_found(blob))?;
            stored.check_write_lease(blob, lease_id)?;
        }
        self.blobs.remove(blob);
        self.stats.lock().deletes += 1;
        Ok(())
    }
}

/// Hands out one shared in-memory store per account
#[derive(Debug, Default)]
pub struct MemoryConnector {
    stores: DashMap<String, Arc<MemoryBlobStore>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for `account`, created on first use
    pub fn store(&self, account: &str) -> Arc<MemoryBlobStore> {
        self.stores
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(MemoryBlobStore::new(account)))
            .clone()
    }
}

impl StoreConnector for MemoryConnector {
    fn connect(&self, account: &str, key: &str) -> Result<Arc<dyn BlobStore>> {
        STANDARD.decode(key).map_err(|e| {
            DyskError::Validation(format!(
                "Invalid account key. Must be a base64 encoded string. Error:{}",
                e
            ))
        })?;
        Ok(self.store(account))
    }
}
