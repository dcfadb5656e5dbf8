//! Verity metadata block: signed dm-verity table stored inside the image.
//!
//! # Layout
//! The metadata occupies a 32 KiB region.  All integers are little-endian.
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 4    | `magic` (`0xb001b001`, or `0x46464f56` when disabled) |
//! | 4      | 4    | `version` (0) |
//! | 8      | 256  | `signature` (RSA-2048 over the table) |
//! | 264    | 4    | `length` (table bytes) |
//! | 268    | var  | table string, zero padded to the end of the region |
//!
//! Signature checking is delegated to a caller-supplied [`SignatureVerifier`].

pub mod table;

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::hashtree::tree_size;
use crate::BLOCK_SIZE;
pub use table::VerityTable;

pub const VERITY_METADATA_SIZE: u64 = 32 * 1024;
pub const VERITY_MAGIC: u32 = 0xb001_b001;
pub const VERITY_MAGIC_DISABLE: u32 = 0x4646_4f56;
pub const VERITY_VERSION: u32 = 0;
pub const RSA_SIGNATURE_SIZE: usize = 256;
pub const VERITY_HEADER_SIZE: usize = 4 + 4 + RSA_SIGNATURE_SIZE + 4;
pub const VERITY_MIN_TABLE_SIZE: u32 = table::VERITY_TABLE_ARGS as u32;
pub const VERITY_MAX_TABLE_SIZE: u32 = VERITY_METADATA_SIZE as u32 - VERITY_HEADER_SIZE as u32;

#[derive(Error, Debug)]
pub enum VerityError {
    #[error("Invalid verity magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported verity version: {0}")]
    UnsupportedVersion(u32),
    #[error("Invalid verity table length: {0}")]
    InvalidTableLength(u32),
    #[error("Invalid verity table: {0}")]
    InvalidTable(String),
    #[error("Unsupported verity hash algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Verity table is not valid UTF-8")]
    NotUtf8,
    #[error("Verity signature check failed")]
    SignatureInvalid,
    #[error("Verity table of {0:?} metadata carries no signature of its own")]
    Unsigned(MetadataFormat),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityHeader {
    pub magic:     u32,
    pub version:   u32,
    pub signature: [u8; RSA_SIGNATURE_SIZE],
    pub length:    u32,
}

impl VerityHeader {
    pub fn read<R: Read>(mut r: R) -> io::Result<Self> {
        let magic = r.read_u32::<LittleEndian>()?;
        let version = r.read_u32::<LittleEndian>()?;
        let mut signature = [0u8; RSA_SIGNATURE_SIZE];
        r.read_exact(&mut signature)?;
        let length = r.read_u32::<LittleEndian>()?;
        Ok(Self { magic, version, signature, length })
    }

    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.magic)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_all(&self.signature)?;
        w.write_u32::<LittleEndian>(self.length)?;
        Ok(())
    }

    pub fn is_disabled(&self) -> bool {
        self.magic == VERITY_MAGIC_DISABLE
    }

    /// Checks the header found at `offset` of an image whose readable area is
    /// `data_size` bytes.
    pub fn validate(&self, offset: u64, data_size: u64) -> Result<(), VerityError> {
        if self.magic != VERITY_MAGIC && self.magic != VERITY_MAGIC_DISABLE {
            return Err(VerityError::InvalidMagic(self.magic));
        }
        if self.version != VERITY_VERSION {
            return Err(VerityError::UnsupportedVersion(self.version));
        }
        if !(VERITY_MIN_TABLE_SIZE..=VERITY_MAX_TABLE_SIZE).contains(&self.length) {
            return Err(VerityError::InvalidTableLength(self.length));
        }
        match offset.checked_add(VERITY_HEADER_SIZE as u64 + u64::from(self.length)) {
            Some(end) if end <= data_size => Ok(()),
            _ => Err(VerityError::InvalidTableLength(self.length)),
        }
    }
}

/// Finds the block-aligned data size `o` with
/// `o + VERITY_METADATA_SIZE + tree_size(o) == end`, i.e. where the metadata
/// starts in an image laid out as `[data][metadata][hash tree]` ending at
/// `end`.
pub fn metadata_offset_for(end: u64) -> Option<u64> {
    if end % BLOCK_SIZE != 0 || end <= VERITY_METADATA_SIZE {
        return None;
    }
    let total = |blocks: u64| {
        let o = blocks * BLOCK_SIZE;
        o + VERITY_METADATA_SIZE + tree_size(o, BLOCK_SIZE, table::VERITY_DIGEST_SIZE as u64)
    };
    // `total` is monotonic; find the smallest block count reaching `end`.
    let (mut lo, mut hi) = (0u64, (end - VERITY_METADATA_SIZE) / BLOCK_SIZE);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if total(mid) < end {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    (total(lo) == end).then_some(lo * BLOCK_SIZE)
}

/// Builds a complete 32 KiB metadata region for `table`.
pub fn build_metadata(
    table: &VerityTable,
    signature: Option<&[u8; RSA_SIGNATURE_SIZE]>,
    disabled: bool,
) -> Result<Vec<u8>, VerityError> {
    let text = table.to_string();
    let length = u32::try_from(text.len()).map_err(|_| VerityError::InvalidTableLength(u32::MAX))?;
    if !(VERITY_MIN_TABLE_SIZE..=VERITY_MAX_TABLE_SIZE).contains(&length) {
        return Err(VerityError::InvalidTableLength(length));
    }
    let header = VerityHeader {
        magic: if disabled { VERITY_MAGIC_DISABLE } else { VERITY_MAGIC },
        version: VERITY_VERSION,
        signature: signature.copied().unwrap_or([0u8; RSA_SIGNATURE_SIZE]),
        length,
    };

    let mut block = vec![0u8; VERITY_METADATA_SIZE as usize];
    let mut cursor = Cursor::new(&mut block[..]);
    header.write(&mut cursor)?;
    cursor.write_all(text.as_bytes())?;
    Ok(block)
}

// ── Signature seam ───────────────────────────────────────────────────────────

/// Checks the RSA signature over a verity table.  Implemented by the caller
/// with whatever key store the platform uses.
pub trait SignatureVerifier {
    fn verify(&self, signature: &[u8; RSA_SIGNATURE_SIZE], table: &[u8]) -> bool;
}

impl<F> SignatureVerifier for F
where
    F: Fn(&[u8; RSA_SIGNATURE_SIZE], &[u8]) -> bool,
{
    fn verify(&self, signature: &[u8; RSA_SIGNATURE_SIZE], table: &[u8]) -> bool {
        self(signature, table)
    }
}

// ── Parsed metadata ──────────────────────────────────────────────────────────

fn serialize_hex<S: Serializer, T: AsRef<[u8]>>(bytes: &T, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

/// Where verity metadata was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataFormat {
    /// 32 KiB metadata block holding a signed table.
    #[default]
    Legacy,
    /// Hashtree descriptor of an AVB vbmeta blob; `metadata_start` is the
    /// vbmeta offset and `table` is derived from the descriptor.
    Avb,
}

/// Verity metadata as seen by an open image.
#[derive(Debug, Clone, Serialize)]
pub struct VerityMetadata {
    pub format:         MetadataFormat,
    /// Metadata carries the disable magic, or verity parsing was turned off.
    pub disabled:       bool,
    /// Length of the verity-protected prefix.
    pub data_size:      u64,
    /// Byte offset of the metadata region.
    pub metadata_start: u64,
    #[serde(serialize_with = "serialize_hex")]
    pub signature:      [u8; RSA_SIGNATURE_SIZE],
    pub table:          String,
    pub table_length:   u32,
    #[serde(skip)]
    pub parsed:         Option<VerityTable>,
}

impl VerityMetadata {
    /// Metadata for an image without (or with ignored) verity.
    pub fn absent() -> Self {
        Self {
            format:         MetadataFormat::Legacy,
            disabled:       true,
            data_size:      0,
            metadata_start: 0,
            signature:      [0u8; RSA_SIGNATURE_SIZE],
            table:          String::new(),
            table_length:   0,
            parsed:         None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.parsed.is_some()
    }

    pub fn root_digest_hex(&self) -> Option<String> {
        self.parsed.as_ref().map(|t| hex::encode(t.root_digest))
    }

    /// Hands the signature and raw table to `verifier`.
    pub fn verify_signature(&self, verifier: &dyn SignatureVerifier) -> Result<(), VerityError> {
        if self.parsed.is_none() {
            return Err(VerityError::InvalidTable("no verity metadata".into()));
        }
        if self.format == MetadataFormat::Avb {
            return Err(VerityError::Unsigned(self.format));
        }
        if verifier.verify(&self.signature, self.table.as_bytes()) {
            Ok(())
        } else {
            Err(VerityError::SignatureInvalid)
        }
    }
}
