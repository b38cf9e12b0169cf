//! Page blob storage backends
//!
//! The orchestrator only needs a narrow set of capabilities from cloud
//! storage: container and page blob management, byte-range I/O, properties
//! and metadata, and exclusive leases. Backends implement [`BlobStore`];
//! a [`StoreConnector`] builds a store for a given account.

pub mod auth;
pub mod azure;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::device::limits;
use crate::error::{DyskError, Result};

/// A page blob addressed as `/<container>/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobRef {
    pub container: String,
    pub name: String,
}

impl BlobRef {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }

    /// Parse a device path; it must contain exactly two forward slashes
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() || path.len() > limits::BLOB_PATH_LEN {
            return Err(DyskError::Validation(format!(
                "Invalid path. Must be <= {}",
                limits::BLOB_PATH_LEN
            )));
        }
        if path.matches('/').count() != 2 {
            return Err(DyskError::Validation(
                "too many forward slashes in dysk path".to_string(),
            ));
        }

        let rest = path.strip_prefix('/').ok_or_else(|| {
            DyskError::Validation(format!("Invalid path {}. Must be /container/blob", path))
        })?;
        match rest.split_once('/') {
            Some((container, name)) if !container.is_empty() && !name.is_empty() => {
                Ok(Self::new(container, name))
            }
            _ => Err(DyskError::Validation(format!(
                "Invalid path {}. Must be /container/blob",
                path
            ))),
        }
    }

    /// Device path form
    pub fn path(&self) -> String {
        format!("/{}/{}", self.container, self.name)
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.container, self.name)
    }
}

/// Inclusive byte range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The last `len` bytes of an object of `size` bytes
    pub fn tail(size: u64, len: u64) -> Self {
        Self {
            start: size - len,
            end: size - 1,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Blob kinds reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobType {
    Page,
    Block,
    Append,
}

impl BlobType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PageBlob" => Some(BlobType::Page),
            "BlockBlob" => Some(BlobType::Block),
            "AppendBlob" => Some(BlobType::Append),
            _ => None,
        }
    }
}

/// Lease state of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseState {
    #[default]
    Available,
    Leased,
    Breaking,
    Broken,
    Expired,
}

impl LeaseState {
    pub fn parse(s: &str) -> Self {
        match s {
            "leased" => LeaseState::Leased,
            "breaking" => LeaseState::Breaking,
            "broken" => LeaseState::Broken,
            "expired" => LeaseState::Expired,
            _ => LeaseState::Available,
        }
    }
}

/// Lease duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDuration {
    /// Held until released or broken
    Infinite,
    /// Fixed duration in seconds (15-60)
    Seconds(u32),
}

impl LeaseDuration {
    /// Value of the `x-ms-lease-duration` header
    pub fn header_value(&self) -> String {
        match self {
            LeaseDuration::Infinite => "-1".to_string(),
            LeaseDuration::Seconds(s) => s.to_string(),
        }
    }
}

/// Blob properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub content_length: u64,
    pub blob_type: Option<BlobType>,
    pub lease_state: LeaseState,
    pub metadata: BTreeMap<String, String>,
}

/// Core storage trait for page blob backends
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Storage account this store operates on
    fn account(&self) -> &str;

    /// Create a container; returns false if it already existed
    async fn create_container_if_absent(&self, container: &str) -> Result<bool>;

    async fn container_exists(&self, container: &str) -> Result<bool>;

    async fn blob_exists(&self, blob: &BlobRef) -> Result<bool>;

    /// Create a zero-filled page blob of `size` bytes (multiple of 512)
    async fn create_page_blob(&self, blob: &BlobRef, size: u64) -> Result<()>;

    /// Write `data` to `range`; the range must be 512-byte aligned
    async fn write_range(
        &self,
        blob: &BlobRef,
        range: ByteRange,
        data: Bytes,
        lease_id: Option<&str>,
    ) -> Result<()>;

    async fn read_range(
        &self,
        blob: &BlobRef,
        range: ByteRange,
        lease_id: Option<&str>,
    ) -> Result<Bytes>;

    async fn properties(&self, blob: &BlobRef, lease_id: Option<&str>) -> Result<BlobProperties>;

    /// Replace the blob's metadata
    async fn set_metadata(
        &self,
        blob: &BlobRef,
        metadata: &BTreeMap<String, String>,
        lease_id: Option<&str>,
    ) -> Result<()>;

    /// Acquire a lease and return its id
    async fn acquire_lease(&self, blob: &BlobRef, duration: LeaseDuration) -> Result<String>;

    /// Break the current lease; `break_period_secs` of 0 breaks immediately
    async fn break_lease(&self, blob: &BlobRef, break_period_secs: u32) -> Result<()>;

    async fn delete_blob(&self, blob: &BlobRef, lease_id: Option<&str>) -> Result<()>;
}

/// Builds stores for storage accounts
pub trait StoreConnector: Send + Sync {
    fn connect(&self, account: &str, key: &str) -> Result<Arc<dyn BlobStore>>;
}
