//! Filesystem superblock readers.
//!
//! When verity metadata cannot be found from the image geometry alone, the
//! filesystem size reported by its own superblock says where the filesystem
//! ends and the metadata begins.  Only the fields needed for that are read.
//!
//! | Filesystem | Superblock at | Magic | Size fields |
//! |------------|---------------|-------|-------------|
//! | ext4 | 1024 | `0xEF53` at +0x38 | `blocks_count_lo` +0x04, `blocks_count_hi` +0x150 (64-bit only), `log_block_size` +0x18 |
//! | squashfs | 0 | `hsqs` at +0 | `bytes_used` +40, padded to 4 KiB |

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::interleave::round_up;
use crate::BLOCK_SIZE;

pub const EXT4_SUPERBLOCK_OFFSET: u64 = 1024;
pub const EXT4_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT4_MAGIC: u16 = 0xEF53;
const EXT4_FEATURE_INCOMPAT_64BIT: u32 = 0x80;

pub const SQUASHFS_SUPERBLOCK_SIZE: usize = 96;
pub const SQUASHFS_MAGIC: u32 = 0x7371_7368;
const SQUASHFS_MAJOR: u16 = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SuperblockError {
    #[error("Superblock buffer too short: {0} bytes")]
    Truncated(usize),
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("Implausible filesystem geometry")]
    BadGeometry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext4,
    Squashfs,
}

impl FsKind {
    /// Byte offset and length of the superblock inside the image.
    pub fn superblock_range(self) -> (u64, usize) {
        match self {
            FsKind::Ext4 => (EXT4_SUPERBLOCK_OFFSET, EXT4_SUPERBLOCK_SIZE),
            FsKind::Squashfs => (0, SQUASHFS_SUPERBLOCK_SIZE),
        }
    }

    pub fn filesystem_size(self, sb: &[u8]) -> Result<u64, SuperblockError> {
        match self {
            FsKind::Ext4 => ext4_size(sb),
            FsKind::Squashfs => squashfs_size(sb),
        }
    }
}

/// Filesystem size in bytes from an ext4 superblock (the 1024 bytes at
/// offset 1024 of the image).
pub fn ext4_size(sb: &[u8]) -> Result<u64, SuperblockError> {
    if sb.len() < EXT4_SUPERBLOCK_SIZE {
        return Err(SuperblockError::Truncated(sb.len()));
    }
    if LittleEndian::read_u16(&sb[0x38..]) != EXT4_MAGIC {
        return Err(SuperblockError::InvalidMagic);
    }
    let log_block_size = LittleEndian::read_u32(&sb[0x18..]);
    if log_block_size > 6 {
        return Err(SuperblockError::BadGeometry);
    }
    let block_size = 1024u64 << log_block_size;

    let mut blocks = u64::from(LittleEndian::read_u32(&sb[0x04..]));
    let incompat = LittleEndian::read_u32(&sb[0x60..]);
    if incompat & EXT4_FEATURE_INCOMPAT_64BIT != 0 {
        blocks |= u64::from(LittleEndian::read_u32(&sb[0x150..])) << 32;
    }
    blocks.checked_mul(block_size).ok_or(SuperblockError::BadGeometry)
}

/// Filesystem size in bytes from a squashfs superblock, padded to 4 KiB.
pub fn squashfs_size(sb: &[u8]) -> Result<u64, SuperblockError> {
    if sb.len() < SQUASHFS_SUPERBLOCK_SIZE {
        return Err(SuperblockError::Truncated(sb.len()));
    }
    if LittleEndian::read_u32(&sb[0..]) != SQUASHFS_MAGIC {
        return Err(SuperblockError::InvalidMagic);
    }
    let major = LittleEndian::read_u16(&sb[28..]);
    if major != SQUASHFS_MAJOR {
        return Err(SuperblockError::UnsupportedVersion(u32::from(major)));
    }
    let bytes_used = LittleEndian::read_u64(&sb[40..]);
    if bytes_used > u64::MAX - BLOCK_SIZE {
        return Err(SuperblockError::BadGeometry);
    }
    Ok(round_up(bytes_used, BLOCK_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext4_superblock(blocks: u64, log_block_size: u32, wide: bool) -> Vec<u8> {
        let mut sb = vec![0u8; EXT4_SUPERBLOCK_SIZE];
        LittleEndian::write_u32(&mut sb[0x04..], blocks as u32);
        LittleEndian::write_u32(&mut sb[0x18..], log_block_size);
        LittleEndian::write_u16(&mut sb[0x38..], EXT4_MAGIC);
        if wide {
            LittleEndian::write_u32(&mut sb[0x60..], EXT4_FEATURE_INCOMPAT_64BIT);
            LittleEndian::write_u32(&mut sb[0x150..], (blocks >> 32) as u32);
        }
        sb
    }

    #[test]
    fn ext4_size_from_block_count() {
        assert_eq!(ext4_size(&ext4_superblock(256, 2, false)).unwrap(), 256 * 4096);
        assert_eq!(ext4_size(&ext4_superblock((1 << 32) + 1, 2, true)).unwrap(), ((1u64 << 32) + 1) * 4096);
        // Without the 64-bit feature the high word is ignored.
        let mut sb = ext4_superblock(10, 0, false);
        LittleEndian::write_u32(&mut sb[0x150..], 1);
        assert_eq!(ext4_size(&sb).unwrap(), 10 * 1024);
    }

    #[test]
    fn ext4_rejects_garbage() {
        assert_eq!(ext4_size(&[0u8; 1024]), Err(SuperblockError::InvalidMagic));
        assert_eq!(ext4_size(&[0u8; 10]), Err(SuperblockError::Truncated(10)));
        assert_eq!(ext4_size(&ext4_superblock(1, 40, false)), Err(SuperblockError::BadGeometry));
    }

    #[test]
    fn squashfs_size_is_padded() {
        let mut sb = vec![0u8; SQUASHFS_SUPERBLOCK_SIZE];
        LittleEndian::write_u32(&mut sb[0..], SQUASHFS_MAGIC);
        LittleEndian::write_u16(&mut sb[28..], 4);
        LittleEndian::write_u64(&mut sb[40..], 5000);
        assert_eq!(squashfs_size(&sb).unwrap(), 8192);

        LittleEndian::write_u16(&mut sb[28..], 3);
        assert_eq!(squashfs_size(&sb), Err(SuperblockError::UnsupportedVersion(3)));
    }

    #[test]
    fn kinds_dispatch_to_their_parser() {
        assert_eq!(FsKind::Ext4.superblock_range(), (1024, 1024));
        assert_eq!(FsKind::Squashfs.superblock_range(), (0, 96));
        let sb = ext4_superblock(8, 2, false);
        assert_eq!(FsKind::Ext4.filesystem_size(&sb).unwrap(), 8 * 4096);
        assert_eq!(FsKind::Squashfs.filesystem_size(&sb[..96]), Err(SuperblockError::InvalidMagic));
    }
}
