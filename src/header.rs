//! FEC trailer header.
//!
//! The header occupies the last `BLOCK_SIZE` bytes of the image.  The same
//! 60-byte record is stored twice inside that block: once at the start
//! (primary) and once at the very end (backup).  All fields are
//! little-endian:
//!
//! | Offset | Size | Field      |
//! |--------|------|------------|
//! | 0      | 4    | `magic` (`0xFECFECFE`) |
//! | 4      | 4    | `version` (0) |
//! | 8      | 4    | `size` (60) |
//! | 12     | 4    | `roots` |
//! | 16     | 4    | `fec_size` (parity bytes) |
//! | 20     | 8    | `inp_size` (protected bytes) |
//! | 28     | 32   | `hash` (SHA-256 of the parity bytes) |

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

use crate::interleave::{Geometry, RS_SYMBOLS};
use crate::BLOCK_SIZE;

pub const FEC_MAGIC: u32 = 0xFECF_ECFE;
pub const FEC_VERSION: u32 = 0;
pub const FEC_HEADER_SIZE: usize = 60;
pub const FEC_HASH_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Invalid FEC header magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported FEC header version: {0}")]
    UnsupportedVersion(u32),
    #[error("Unexpected FEC header size: {0}")]
    InvalidSize(u32),
    #[error("Invalid number of roots: {0}")]
    InvalidRoots(u32),
    #[error("Unexpected number of roots: {found} (expected {expected})")]
    RootsMismatch { expected: u8, found: u8 },
    #[error("Inconsistent FEC size {fec_size} for {inp_size} input bytes")]
    InconsistentFecSize { fec_size: u32, inp_size: u64 },
    #[error("Protected size {inp_size} does not fit a {file_size}-byte image with {fec_size} parity bytes")]
    InconsistentInputSize { inp_size: u64, fec_size: u32, file_size: u64 },
    #[error("Image too small for an FEC trailer ({0} bytes)")]
    TooSmall(u64),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecHeader {
    pub magic:    u32,
    pub version:  u32,
    pub size:     u32,
    pub roots:    u32,
    pub fec_size: u32,
    pub inp_size: u64,
    pub hash:     [u8; FEC_HASH_SIZE],
}

impl FecHeader {
    pub fn new(roots: u8, fec_size: u32, inp_size: u64, hash: [u8; FEC_HASH_SIZE]) -> Self {
        Self {
            magic:    FEC_MAGIC,
            version:  FEC_VERSION,
            size:     FEC_HEADER_SIZE as u32,
            roots:    u32::from(roots),
            fec_size,
            inp_size,
            hash,
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.size)?;
        writer.write_u32::<LittleEndian>(self.roots)?;
        writer.write_u32::<LittleEndian>(self.fec_size)?;
        writer.write_u64::<LittleEndian>(self.inp_size)?;
        writer.write_all(&self.hash)?;
        Ok(())
    }

    /// Parses a header record and checks the fields that do not depend on the
    /// surrounding image.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, HeaderError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != FEC_MAGIC {
            return Err(HeaderError::InvalidMagic(magic));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != FEC_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        let size = reader.read_u32::<LittleEndian>()?;
        if size != FEC_HEADER_SIZE as u32 {
            return Err(HeaderError::InvalidSize(size));
        }
        let roots = reader.read_u32::<LittleEndian>()?;
        if roots == 0 || u64::from(roots) >= RS_SYMBOLS {
            return Err(HeaderError::InvalidRoots(roots));
        }
        let fec_size = reader.read_u32::<LittleEndian>()?;
        let inp_size = reader.read_u64::<LittleEndian>()?;
        let mut hash = [0u8; FEC_HASH_SIZE];
        reader.read_exact(&mut hash)?;

        Ok(Self { magic, version, size, roots, fec_size, inp_size, hash })
    }

    /// Validated root count; always in `1..=254` after [`FecHeader::read`].
    pub fn roots_u8(&self) -> u8 {
        self.roots as u8
    }

    pub fn geometry(&self) -> Result<Geometry, HeaderError> {
        Geometry::new(self.inp_size, self.roots_u8()).map_err(|_| HeaderError::InvalidRoots(self.roots))
    }

    /// Checks this header against the image it was read from.
    ///
    /// `expected_roots` is the root count the caller opened the image with;
    /// `file_size` is the size of the whole backing image.
    pub fn validate(&self, expected_roots: u8, file_size: u64) -> Result<(), HeaderError> {
        if self.roots_u8() != expected_roots {
            return Err(HeaderError::RootsMismatch { expected: expected_roots, found: self.roots_u8() });
        }
        if self.fec_size % self.roots != 0 || u64::from(self.fec_size) % BLOCK_SIZE != 0 {
            return Err(HeaderError::InconsistentFecSize { fec_size: self.fec_size, inp_size: self.inp_size });
        }
        if self.inp_size % BLOCK_SIZE != 0
            || self.inp_size.checked_add(u64::from(self.fec_size)).and_then(|s| s.checked_add(BLOCK_SIZE))
                != Some(file_size)
        {
            return Err(HeaderError::InconsistentInputSize {
                inp_size:  self.inp_size,
                fec_size:  self.fec_size,
                file_size,
            });
        }
        if u64::from(self.fec_size) != self.geometry()?.parity_size() {
            return Err(HeaderError::InconsistentFecSize { fec_size: self.fec_size, inp_size: self.inp_size });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; FEC_HEADER_SIZE] {
        let mut buf = [0u8; FEC_HEADER_SIZE];
        // A fixed-size cursor over the exact record length cannot run short.
        let _ = self.write(Cursor::new(&mut buf[..]));
        buf
    }

    /// The final trailer block: primary copy at the start, backup at the end,
    /// zeros in between.
    pub fn to_block(&self) -> Vec<u8> {
        let record = self.to_bytes();
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        block[..FEC_HEADER_SIZE].copy_from_slice(&record);
        block[BLOCK_SIZE as usize - FEC_HEADER_SIZE..].copy_from_slice(&record);
        block
    }

    /// Parses the trailer block, preferring the primary copy and falling back
    /// to the backup when the primary is damaged.
    ///
    /// Returns the header and whether the backup copy was used.
    pub fn from_block(block: &[u8], expected_roots: u8, file_size: u64) -> Result<(Self, bool), HeaderError> {
        if block.len() < BLOCK_SIZE as usize {
            return Err(HeaderError::TooSmall(block.len() as u64));
        }
        let primary = Self::read(&block[..FEC_HEADER_SIZE])
            .and_then(|h| h.validate(expected_roots, file_size).map(|_| h));
        match primary {
            Ok(h) => Ok((h, false)),
            Err(primary_err) => {
                let tail = &block[BLOCK_SIZE as usize - FEC_HEADER_SIZE..BLOCK_SIZE as usize];
                match Self::read(tail).and_then(|h| h.validate(expected_roots, file_size).map(|_| h)) {
                    Ok(h) => Ok((h, true)),
                    Err(_) => Err(primary_err),
                }
            }
        }
    }
}
