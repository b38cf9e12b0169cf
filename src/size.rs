//! Size arithmetic between cloud object sizes and kernel sectors
//!
//! The device manager sees `sector_count * 512` bytes. When a VHD footer is
//! present it occupies the last [`TRAILER_SIZE`] bytes of the object, so the
//! visible payload is the object size minus the footer.

use crate::error::{DyskError, Result};
use crate::vhd::FOOTER_SIZE;

/// Bytes per kernel sector
pub const SECTOR_SIZE: u64 = 512;

/// Bytes per gigabyte (binary)
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Size of the optional trailer at the tail of an object
pub const TRAILER_SIZE: u64 = FOOTER_SIZE as u64;

/// Largest page blob the service accepts, 8 TiB
pub const MAX_SIZE_GB: u64 = 8192;

/// Check a requested size before provisioning anything
pub fn check_size_gb(size_gb: u64) -> Result<()> {
    if size_gb == 0 || size_gb > MAX_SIZE_GB {
        return Err(DyskError::Validation(format!(
            "Invalid size. Must be between 1 and {} GB",
            MAX_SIZE_GB
        )));
    }
    Ok(())
}

fn too_large(size_gb: u64) -> DyskError {
    DyskError::Validation(format!(
        "Invalid size. {}GB is larger than {} GB",
        size_gb, MAX_SIZE_GB
    ))
}

/// Billed object size for `size_gb`
pub fn object_bytes(size_gb: u64) -> Result<u64> {
    size_gb.checked_mul(GIB).ok_or_else(|| too_large(size_gb))
}

/// Bytes visible to the kernel for an object of `size_gb`
pub fn payload_bytes(size_gb: u64, trailer: bool) -> Result<u64> {
    let bytes = object_bytes(size_gb)?;
    if trailer {
        Ok(bytes.saturating_sub(TRAILER_SIZE))
    } else {
        Ok(bytes)
    }
}

/// Sector count sent over the control channel
pub fn sectors_for(size_gb: u64, trailer: bool) -> Result<u64> {
    Ok(payload_bytes(size_gb, trailer)? / SECTOR_SIZE)
}

/// Inverse of [`sectors_for`]: adds the trailer back before converting to GB.
///
/// The count comes from the device manager, so an out-of-range value is a
/// decode error.
pub fn size_gb_from_sectors(sector_count: u64, trailer: bool) -> Result<u64> {
    let trailer_bytes = if trailer { TRAILER_SIZE } else { 0 };
    sector_count
        .checked_mul(SECTOR_SIZE)
        .and_then(|bytes| bytes.checked_add(trailer_bytes))
        .map(|bytes| bytes / GIB)
        .ok_or_else(|| {
            DyskError::Decode(format!(
                "sector count {} does not fit in a 64-bit byte size",
                sector_count
            ))
        })
}

/// Whole gigabytes in an object of `content_length` bytes
pub fn size_gb_from_object(content_length: u64) -> u64 {
    content_length / GIB
}
