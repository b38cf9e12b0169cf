//! Fixed-disk VHD footer
//!
//! A VHD fixed disk is the raw payload followed by a 512-byte big-endian
//! footer. Writing it to the tail of a page blob makes the blob attachable as
//! a disk image by other tooling.

use chrono::{TimeZone, Utc};

/// Size of the footer in bytes
pub const FOOTER_SIZE: usize = 512;

const COOKIE: &[u8; 8] = b"conectix";
const FEATURES_RESERVED: u32 = 0x0000_0002;
const FORMAT_VERSION: u32 = 0x0001_0000;
const FIXED_DATA_OFFSET: u64 = u64::MAX;
const CREATOR_APP: &[u8; 4] = b"dysk";
const CREATOR_VERSION: u32 = 0x0001_0000;
const CREATOR_HOST_OS: &[u8; 4] = b"Wi2k";
const DISK_TYPE_FIXED: u32 = 2;

// Field offsets within the footer
const OFF_COOKIE: usize = 0;
const OFF_FEATURES: usize = 8;
const OFF_VERSION: usize = 12;
const OFF_DATA_OFFSET: usize = 16;
const OFF_TIMESTAMP: usize = 24;
const OFF_CREATOR_APP: usize = 28;
const OFF_CREATOR_VERSION: usize = 32;
const OFF_CREATOR_HOST: usize = 36;
const OFF_ORIGINAL_SIZE: usize = 40;
const OFF_CURRENT_SIZE: usize = 48;
const OFF_GEOMETRY: usize = 56;
const OFF_DISK_TYPE: usize = 60;
const OFF_CHECKSUM: usize = 64;
const OFF_UNIQUE_ID: usize = 68;
const OFF_SAVED_STATE: usize = 84;

/// Disk geometry as cylinders/heads/sectors-per-track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl Geometry {
    /// CHS geometry for a disk of `size` bytes, per the VHD format specification
    pub fn for_size(size: u64) -> Self {
        let mut total_sectors = size / 512;
        if total_sectors > 65535 * 16 * 255 {
            total_sectors = 65535 * 16 * 255;
        }

        let (sectors_per_track, heads, cylinder_times_heads) = if total_sectors >= 65535 * 16 * 63 {
            (255u64, 16u64, total_sectors / 255)
        } else {
            let mut spt = 17u64;
            let mut cth = total_sectors / spt;
            let mut heads = ((cth + 1023) / 1024).max(4);

            if cth >= heads * 1024 || heads > 16 {
                spt = 31;
                heads = 16;
                cth = total_sectors / spt;
            }
            if cth >= heads * 1024 {
                spt = 63;
                heads = 16;
                cth = total_sectors / spt;
            }
            (spt, heads, cth)
        };

        Self {
            cylinders: (cylinder_times_heads / heads) as u16,
            heads: heads as u8,
            sectors_per_track: sectors_per_track as u8,
        }
    }
}

/// Seconds since 2000-01-01T00:00:00Z, the VHD epoch
fn vhd_timestamp() -> u32 {
    let epoch = Utc
        .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp())
        .unwrap_or(946_684_800);
    (Utc::now().timestamp() - epoch).max(0) as u32
}

/// Build the footer for a fixed disk whose payload is `disk_size` bytes
pub fn fixed_footer(disk_size: u64) -> [u8; FOOTER_SIZE] {
    let mut footer = [0u8; FOOTER_SIZE];
    let geometry = Geometry::for_size(disk_size);

    footer[OFF_COOKIE..OFF_COOKIE + 8].copy_from_slice(COOKIE);
    footer[OFF_FEATURES..OFF_FEATURES + 4].copy_from_slice(&FEATURES_RESERVED.to_be_bytes());
    footer[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    footer[OFF_DATA_OFFSET..OFF_DATA_OFFSET + 8].copy_from_slice(&FIXED_DATA_OFFSET.to_be_bytes());
    footer[OFF_TIMESTAMP..OFF_TIMESTAMP + 4].copy_from_slice(&vhd_timestamp().to_be_bytes());
    footer[OFF_CREATOR_APP..OFF_CREATOR_APP + 4].copy_from_slice(CREATOR_APP);
    footer[OFF_CREATOR_VERSION..OFF_CREATOR_VERSION + 4]
        .copy_from_slice(&CREATOR_VERSION.to_be_bytes());
    footer[OFF_CREATOR_HOST..OFF_CREATOR_HOST + 4].copy_from_slice(CREATOR_HOST_OS);
    footer[OFF_ORIGINAL_SIZE..OFF_ORIGINAL_SIZE + 8].copy_from_slice(&disk_size.to_be_bytes());
    footer[OFF_CURRENT_SIZE..OFF_CURRENT_SIZE + 8].copy_from_slice(&disk_size.to_be_bytes());
    footer[OFF_GEOMETRY..OFF_GEOMETRY + 2].copy_from_slice(&geometry.cylinders.to_be_bytes());
    footer[OFF_GEOMETRY + 2] = geometry.heads;
    footer[OFF_GEOMETRY + 3] = geometry.sectors_per_track;
    footer[OFF_DISK_TYPE..OFF_DISK_TYPE + 4].copy_from_slice(&DISK_TYPE_FIXED.to_be_bytes());
    footer[OFF_UNIQUE_ID..OFF_UNIQUE_ID + 16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    footer[OFF_SAVED_STATE] = 0;

    let checksum = checksum(&footer);
    footer[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&checksum.to_be_bytes());
    footer
}

/// One's complement of the byte sum, skipping the checksum field itself
pub fn checksum(footer: &[u8; FOOTER_SIZE]) -> u32 {
    let sum = footer
        .iter()
        .enumerate()
        .filter(|(i, _)| !(OFF_CHECKSUM..OFF_CHECKSUM + 4).contains(i))
        .fold(0u32, |acc, (_, b)| acc.wrapping_add(*b as u32));
    !sum
}

/// Whether `bytes` looks like a footer produced by [`fixed_footer`]
pub fn is_valid_footer(bytes: &[u8]) -> bool {
    let Ok(footer) = <&[u8; FOOTER_SIZE]>::try_from(bytes) else {
        return false;
    };
    if &footer[OFF_COOKIE..OFF_COOKIE + 8] != COOKIE {
        return false;
    }
    let stored = u32::from_be_bytes([
        footer[OFF_CHECKSUM],
        footer[OFF_CHECKSUM + 1],
        footer[OFF_CHECKSUM + 2],
        footer[OFF_CHECKSUM + 3],
    ]);
    stored == checksum(footer)
}

/// Current size recorded in a footer
pub fn footer_disk_size(footer: &[u8; FOOTER_SIZE]) -> u64 {
    let mut size = [0u8; 8];
    size.copy_from_slice(&footer[OFF_CURRENT_SIZE..OFF_CURRENT_SIZE + 8]);
    u64::from_be_bytes(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::GIB;

    #[test]
    fn test_footer_layout() {
        let size = 4 * GIB - FOOTER_SIZE as u64;
        let footer = fixed_footer(size);

        assert_eq!(&footer[0..8], b"conectix");
        assert_eq!(&footer[28..32], b"dysk");
        assert_eq!(&footer[60..64], &2u32.to_be_bytes());
        assert_eq!(&footer[16..24], &[0xff; 8]);
        assert_eq!(footer_disk_size(&footer), size);
        assert!(footer[85..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_footer_checksum_validates() {
        let footer = fixed_footer(GIB);
        assert!(is_valid_footer(&footer));

        let mut corrupted = footer;
        corrupted[40] ^= 0x01;
        assert!(!is_valid_footer(&corrupted));
        assert!(!is_valid_footer(&footer[..100]));
    }

    #[test]
    fn test_unique_ids_differ() {
        let a = fixed_footer(GIB);
        let b = fixed_footer(GIB);
        assert_ne!(&a[68..84], &b[68..84]);
    }

    #[test]
    fn test_geometry_small_disk() {
        // 4 GiB stays under the 63-sector threshold.
        let g = Geometry::for_size(4 * GIB);
        assert_eq!(g.heads, 16);
        assert_eq!(g.sectors_per_track, 63);
        assert_eq!(g.cylinders, 8322);
    }

    #[test]
    fn test_geometry_large_disk_is_capped() {
        let g = Geometry::for_size(1024 * GIB);
        assert_eq!(g.heads, 16);
        assert_eq!(g.sectors_per_track, 255);
        assert_eq!(g.cylinders, 65535);
    }
}
