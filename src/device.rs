//! Device records exchanged with the device manager and persisted as JSON

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DyskError, Result};
use crate::size;

/// Field ceilings enforced by the device manager's fixed buffers
pub mod limits {
    pub const DEVICE_NAME_LEN: usize = 32;
    pub const ACCOUNT_NAME_LEN: usize = 256;
    pub const ACCOUNT_KEY_LEN: usize = 128;
    pub const BLOB_PATH_LEN: usize = 1024;
    pub const HOST_LEN: usize = 512;
    pub const IP_LEN: usize = 32;
    pub const LEASE_ID_LEN: usize = 64;
}

/// Access mode of a mounted device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[serde(rename = "R")]
    ReadOnly,
    #[serde(rename = "RW")]
    ReadWrite,
}

impl AccessMode {
    /// Representation used on the wire and in JSON
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "R",
            AccessMode::ReadWrite => "RW",
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, AccessMode::ReadOnly)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = DyskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "R" => Ok(AccessMode::ReadOnly),
            "RW" => Ok(AccessMode::ReadWrite),
            _ => Err(DyskError::Validation(
                "Invalid type. Must be R or RW".to_string(),
            )),
        }
    }
}

/// A block device backed by a page blob.
///
/// `sector_count`, `host` and `ip` travel over the control channel but are not
/// part of the JSON interchange format; `major`/`minor` are assigned by the
/// device manager on mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRecord {
    #[serde(rename = "Type")]
    pub mode: AccessMode,
    pub name: String,
    #[serde(skip)]
    pub sector_count: u64,
    pub account_name: String,
    pub account_key: String,
    pub path: String,
    #[serde(skip)]
    pub host: String,
    #[serde(skip)]
    pub ip: String,
    pub lease_id: String,
    #[serde(default)]
    pub major: i64,
    #[serde(default)]
    pub minor: i64,
    #[serde(default)]
    pub vhd: bool,
    #[serde(rename = "SizeGB", default)]
    pub size_gb: u64,
}

impl DeviceRecord {
    /// A record ready to be filled in by the mount pipeline
    pub fn new(mode: AccessMode, name: impl Into<String>, path: impl Into<String>, vhd: bool) -> Self {
        Self {
            mode,
            name: name.into(),
            sector_count: 0,
            account_name: String::new(),
            account_key: String::new(),
            path: path.into(),
            host: String::new(),
            ip: String::new(),
            lease_id: String::new(),
            major: 0,
            minor: 0,
            vhd,
            size_gb: 0,
        }
    }

    /// Load a record from its JSON interchange form
    pub fn from_json(content: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(content)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Set the logical size and derive the sector count from it
    pub fn set_size_gb(&mut self, size_gb: u64) -> Result<()> {
        self.sector_count = size::sectors_for(size_gb, self.vhd)?;
        self.size_gb = size_gb;
        Ok(())
    }

    /// Recompute the logical size from the sector count reported by the device manager
    pub fn size_from_sectors(&mut self) -> Result<()> {
        self.size_gb = size::size_gb_from_sectors(self.sector_count, self.vhd)?;
        Ok(())
    }

    /// Whether `sector_count` and `size_gb` describe the same payload
    pub fn sizes_agree(&self) -> bool {
        match (
            self.sector_count.checked_mul(size::SECTOR_SIZE),
            size::payload_bytes(self.size_gb, self.vhd),
        ) {
            (Some(sector_bytes), Ok(payload)) => sector_bytes == payload,
            _ => false,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.major != 0 || self.minor != 0
    }
}
