//! Android Verified Boot footer and vbmeta parsing.
//!
//! An AVB partition image ends with a 64-byte footer pointing at a vbmeta
//! blob somewhere inside the image.  The hashtree descriptor inside vbmeta
//! says where the verity tree and the FEC data live:
//!
//! ```text
//! [data: image_size][tree: tree_offset, tree_size][FEC: fec_offset, fec_size][vbmeta][..][footer]
//! ```
//!
//! The FEC region holds the usual parity followed by the header block, so
//! the header sits at `fec_offset + fec_size - BLOCK_SIZE` instead of at the
//! end of the image.  All integers are big-endian.
//!
//! Footer (64 bytes at `end - 64`):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 4    | `magic` (`AVBf`) |
//! | 4      | 4    | `version_major` (1) |
//! | 8      | 4    | `version_minor` |
//! | 12     | 8    | `original_image_size` |
//! | 20     | 8    | `vbmeta_offset` |
//! | 28     | 8    | `vbmeta_size` |
//!
//! Only the vbmeta hash is checked here; the signature over it is left to the
//! caller.

use std::io::{self, Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use crate::codec::MAX_ROOTS;
use crate::verity::VerityTable;
use crate::BLOCK_SIZE;

pub const AVB_FOOTER_SIZE: usize = 64;
pub const AVB_FOOTER_MAGIC: &[u8; 4] = b"AVBf";
pub const AVB_FOOTER_VERSION_MAJOR: u32 = 1;
pub const AVB_VBMETA_MAGIC: &[u8; 4] = b"AVB0";
pub const AVB_VBMETA_VERSION_MAJOR: u32 = 1;
pub const VBMETA_HEADER_SIZE: usize = 256;
pub const VBMETA_MAX_SIZE: u64 = 64 * 1024;
pub const AVB_DESCRIPTOR_TAG_HASHTREE: u64 = 1;
pub const VBMETA_FLAG_HASHTREE_DISABLED: u32 = 1 << 0;
pub const VBMETA_FLAG_VERIFICATION_DISABLED: u32 = 1 << 1;

const DESCRIPTOR_HEADER_SIZE: usize = 16;
const HASHTREE_DESCRIPTOR_SIZE: usize = 180;
const HASH_ALGORITHM_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum AvbError {
    #[error("Invalid AVB footer magic")]
    InvalidFooterMagic,
    #[error("Unsupported AVB footer version: {0}")]
    UnsupportedFooterVersion(u32),
    #[error("Invalid vbmeta magic")]
    InvalidVbmetaMagic,
    #[error("Unsupported vbmeta version: {0}")]
    UnsupportedVbmetaVersion(u32),
    #[error("vbmeta of {size} bytes at {offset} does not fit the image")]
    VbmetaOutOfBounds { offset: u64, size: u64 },
    #[error("Malformed vbmeta: {0}")]
    Malformed(&'static str),
    #[error("Unsupported vbmeta algorithm: {0}")]
    UnsupportedAlgorithm(u32),
    #[error("vbmeta hash mismatch")]
    HashMismatch,
    #[error("Unusable hashtree descriptor: {0}")]
    Unusable(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn serialize_hex<S: Serializer, T: AsRef<[u8]>>(bytes: &T, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

fn range(buf: &[u8], start: u64, len: u64) -> Result<&[u8], AvbError> {
    let end = start.checked_add(len).ok_or(AvbError::Malformed("offset overflow"))?;
    if end > buf.len() as u64 {
        return Err(AvbError::Malformed("field runs past the vbmeta blob"));
    }
    Ok(&buf[start as usize..end as usize])
}

// ── Footer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvbFooter {
    pub version_major:       u32,
    pub version_minor:       u32,
    pub original_image_size: u64,
    pub vbmeta_offset:       u64,
    pub vbmeta_size:         u64,
}

impl AvbFooter {
    pub fn parse(buf: &[u8; AVB_FOOTER_SIZE]) -> Result<Self, AvbError> {
        if &buf[..4] != AVB_FOOTER_MAGIC {
            return Err(AvbError::InvalidFooterMagic);
        }
        let mut r = Cursor::new(&buf[4..]);
        let footer = Self {
            version_major:       r.read_u32::<BigEndian>()?,
            version_minor:       r.read_u32::<BigEndian>()?,
            original_image_size: r.read_u64::<BigEndian>()?,
            vbmeta_offset:       r.read_u64::<BigEndian>()?,
            vbmeta_size:         r.read_u64::<BigEndian>()?,
        };
        if footer.version_major != AVB_FOOTER_VERSION_MAJOR {
            return Err(AvbError::UnsupportedFooterVersion(footer.version_major));
        }
        Ok(footer)
    }

    /// Checks that the vbmeta blob lies inside an image of `image_size`
    /// bytes, before the footer.
    pub fn validate(&self, image_size: u64) -> Result<(), AvbError> {
        let oob = AvbError::VbmetaOutOfBounds { offset: self.vbmeta_offset, size: self.vbmeta_size };
        if self.vbmeta_size < VBMETA_HEADER_SIZE as u64 || self.vbmeta_size > VBMETA_MAX_SIZE {
            return Err(oob);
        }
        let limit = image_size.saturating_sub(AVB_FOOTER_SIZE as u64);
        match self.vbmeta_offset.checked_add(self.vbmeta_size) {
            Some(end) if end <= limit && self.original_image_size <= self.vbmeta_offset => Ok(()),
            _ => Err(oob),
        }
    }
}

// ── vbmeta header ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VbmetaHeader {
    pub required_version_major: u32,
    pub required_version_minor: u32,
    pub auth_block_size:        u64,
    pub aux_block_size:         u64,
    pub algorithm:              u32,
    pub hash_offset:            u64,
    pub hash_size:              u64,
    pub descriptors_offset:     u64,
    pub descriptors_size:       u64,
    pub rollback_index:         u64,
    pub flags:                  u32,
}

impl VbmetaHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, AvbError> {
        if buf.len() < VBMETA_HEADER_SIZE {
            return Err(AvbError::Malformed("vbmeta shorter than its header"));
        }
        if &buf[..4] != AVB_VBMETA_MAGIC {
            return Err(AvbError::InvalidVbmetaMagic);
        }
        let mut r = Cursor::new(&buf[4..VBMETA_HEADER_SIZE]);
        let required_version_major = r.read_u32::<BigEndian>()?;
        let required_version_minor = r.read_u32::<BigEndian>()?;
        let auth_block_size = r.read_u64::<BigEndian>()?;
        let aux_block_size = r.read_u64::<BigEndian>()?;
        let algorithm = r.read_u32::<BigEndian>()?;
        let hash_offset = r.read_u64::<BigEndian>()?;
        let hash_size = r.read_u64::<BigEndian>()?;
        // Signature, public key and key metadata ranges.
        let mut skipped = [0u8; 6 * 8];
        r.read_exact(&mut skipped)?;
        let descriptors_offset = r.read_u64::<BigEndian>()?;
        let descriptors_size = r.read_u64::<BigEndian>()?;
        let rollback_index = r.read_u64::<BigEndian>()?;
        let flags = r.read_u32::<BigEndian>()?;

        if required_version_major != AVB_VBMETA_VERSION_MAJOR {
            return Err(AvbError::UnsupportedVbmetaVersion(required_version_major));
        }
        Ok(Self {
            required_version_major,
            required_version_minor,
            auth_block_size,
            aux_block_size,
            algorithm,
            hash_offset,
            hash_size,
            descriptors_offset,
            descriptors_size,
            rollback_index,
            flags,
        })
    }

    /// Checks the digest stored in the authentication block against the
    /// header and auxiliary block.  Unsigned vbmeta (algorithm 0) has none.
    fn verify_hash(&self, vbmeta: &[u8]) -> Result<(), AvbError> {
        let auth = range(vbmeta, VBMETA_HEADER_SIZE as u64, self.auth_block_size)?;
        let aux = range(vbmeta, VBMETA_HEADER_SIZE as u64 + self.auth_block_size, self.aux_block_size)?;
        let header = &vbmeta[..VBMETA_HEADER_SIZE];
        let computed = match self.algorithm {
            0 => return Ok(()),
            1..=3 => Sha256::new().chain_update(header).chain_update(aux).finalize().to_vec(),
            4..=6 => Sha512::new().chain_update(header).chain_update(aux).finalize().to_vec(),
            other => return Err(AvbError::UnsupportedAlgorithm(other)),
        };
        let stored = range(auth, self.hash_offset, self.hash_size)?;
        if stored != computed.as_slice() {
            return Err(AvbError::HashMismatch);
        }
        Ok(())
    }
}

// ── Hashtree descriptor ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashtreeDescriptor {
    pub dm_verity_version: u32,
    pub image_size:        u64,
    pub tree_offset:       u64,
    pub tree_size:         u64,
    pub data_block_size:   u32,
    pub hash_block_size:   u32,
    /// Zero when the image carries no FEC data.
    pub fec_num_roots:     u32,
    pub fec_offset:        u64,
    pub fec_size:          u64,
    pub hash_algorithm:    String,
    pub partition_name:    String,
    #[serde(serialize_with = "serialize_hex")]
    pub salt:              Vec<u8>,
    #[serde(serialize_with = "serialize_hex")]
    pub root_digest:       Vec<u8>,
    pub flags:             u32,
}

impl HashtreeDescriptor {
    /// Parses a whole descriptor, tag and length included.
    fn parse(desc: &[u8]) -> Result<Self, AvbError> {
        if desc.len() < HASHTREE_DESCRIPTOR_SIZE {
            return Err(AvbError::Malformed("hashtree descriptor too short"));
        }
        let mut r = Cursor::new(&desc[DESCRIPTOR_HEADER_SIZE..HASHTREE_DESCRIPTOR_SIZE]);
        let dm_verity_version = r.read_u32::<BigEndian>()?;
        let image_size = r.read_u64::<BigEndian>()?;
        let tree_offset = r.read_u64::<BigEndian>()?;
        let tree_size = r.read_u64::<BigEndian>()?;
        let data_block_size = r.read_u32::<BigEndian>()?;
        let hash_block_size = r.read_u32::<BigEndian>()?;
        let fec_num_roots = r.read_u32::<BigEndian>()?;
        let fec_offset = r.read_u64::<BigEndian>()?;
        let fec_size = r.read_u64::<BigEndian>()?;
        let mut algorithm = [0u8; HASH_ALGORITHM_SIZE];
        r.read_exact(&mut algorithm)?;
        let name_len = r.read_u32::<BigEndian>()?;
        let salt_len = r.read_u32::<BigEndian>()?;
        let digest_len = r.read_u32::<BigEndian>()?;
        let flags = r.read_u32::<BigEndian>()?;

        let name_at = HASHTREE_DESCRIPTOR_SIZE as u64;
        let salt_at = name_at + u64::from(name_len);
        let digest_at = salt_at + u64::from(salt_len);
        let partition_name = String::from_utf8_lossy(range(desc, name_at, name_len.into())?).into_owned();
        let salt = range(desc, salt_at, salt_len.into())?.to_vec();
        let root_digest = range(desc, digest_at, digest_len.into())?.to_vec();

        let end = algorithm.iter().position(|&b| b == 0).unwrap_or(HASH_ALGORITHM_SIZE);
        Ok(Self {
            dm_verity_version,
            image_size,
            tree_offset,
            tree_size,
            data_block_size,
            hash_block_size,
            fec_num_roots,
            fec_offset,
            fec_size,
            hash_algorithm: String::from_utf8_lossy(&algorithm[..end]).into_owned(),
            partition_name,
            salt,
            root_digest,
            flags,
        })
    }

    pub fn has_fec(&self) -> bool {
        self.fec_num_roots != 0 && self.fec_size != 0
    }

    /// Roots of the FEC region, checked against what the codec supports.
    pub fn fec_roots(&self) -> Result<u8, AvbError> {
        match u8::try_from(self.fec_num_roots) {
            Ok(r) if (1..=MAX_ROOTS).contains(&r) => Ok(r),
            _ => Err(AvbError::Unusable(format!("{} FEC roots", self.fec_num_roots))),
        }
    }

    /// End of the FEC region, where its header block finishes.
    pub fn fec_end(&self) -> Option<u64> {
        self.fec_offset.checked_add(self.fec_size)
    }

    /// Checks that every region the descriptor names lies inside an image of
    /// `image_size` bytes.
    fn check_layout(&self, image_size: u64) -> Result<(), AvbError> {
        let tree_end = self.tree_offset.checked_add(self.tree_size);
        if tree_end.map_or(true, |end| end > image_size) || self.tree_offset < self.image_size {
            return Err(AvbError::Unusable("hash tree lies outside the image".into()));
        }
        if self.has_fec() {
            self.fec_roots()?;
            if self.fec_end().map_or(true, |end| end > image_size) || self.fec_size < BLOCK_SIZE {
                return Err(AvbError::Unusable("FEC data lies outside the image".into()));
            }
        }
        Ok(())
    }

    /// The equivalent dm-verity table, if the tree is one this crate can
    /// verify: SHA-256 over 4 KiB blocks.
    pub fn to_verity_table(&self) -> Result<VerityTable, AvbError> {
        if self.hash_algorithm != "sha256" {
            return Err(AvbError::Unusable(format!("hash algorithm {}", self.hash_algorithm)));
        }
        if u64::from(self.data_block_size) != BLOCK_SIZE || u64::from(self.hash_block_size) != BLOCK_SIZE {
            return Err(AvbError::Unusable(format!("block sizes {}/{}", self.data_block_size, self.hash_block_size)));
        }
        let root_digest: [u8; 32] = self
            .root_digest
            .as_slice()
            .try_into()
            .map_err(|_| AvbError::Unusable(format!("{}-byte root digest", self.root_digest.len())))?;
        // A single block has no tree at all; its digest is the root.
        if self.image_size <= BLOCK_SIZE || self.image_size % BLOCK_SIZE != 0 || self.tree_offset % BLOCK_SIZE != 0 {
            return Err(AvbError::Unusable(format!("image size {} tree offset {}", self.image_size, self.tree_offset)));
        }
        let device = if self.partition_name.is_empty() { "avb".to_string() } else { self.partition_name.clone() };
        Ok(VerityTable {
            data_device: device.clone(),
            hash_device: device,
            data_blocks: self.image_size / BLOCK_SIZE,
            hash_start_block: self.tree_offset / BLOCK_SIZE,
            root_digest,
            salt: self.salt.clone(),
            extra: Vec::new(),
        })
    }
}

// ── Image ────────────────────────────────────────────────────────────────────

/// What an AVB footer and its vbmeta say about an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvbImage {
    pub footer:   AvbFooter,
    pub header:   VbmetaHeader,
    pub hashtree: HashtreeDescriptor,
}

impl AvbImage {
    /// Parses the vbmeta blob named by `footer`.  `Ok(None)` means vbmeta
    /// is well formed but carries no hashtree descriptor.
    pub fn parse(footer: AvbFooter, vbmeta: &[u8], image_size: u64) -> Result<Option<Self>, AvbError> {
        let header = VbmetaHeader::parse(vbmeta)?;
        header.verify_hash(vbmeta)?;

        let aux_start = VBMETA_HEADER_SIZE as u64 + header.auth_block_size;
        let aux = range(vbmeta, aux_start, header.aux_block_size)?;
        let descriptors = range(aux, header.descriptors_offset, header.descriptors_size)?;

        let mut at = 0u64;
        while at < descriptors.len() as u64 {
            let mut r = Cursor::new(range(descriptors, at, DESCRIPTOR_HEADER_SIZE as u64)?);
            let tag = r.read_u64::<BigEndian>()?;
            let following = r.read_u64::<BigEndian>()?;
            let len = following
                .checked_add(DESCRIPTOR_HEADER_SIZE as u64)
                .ok_or(AvbError::Malformed("descriptor length overflow"))?;
            if following % 8 != 0 {
                return Err(AvbError::Malformed("descriptor length is not 8-byte aligned"));
            }
            let desc = range(descriptors, at, len)?;
            if tag == AVB_DESCRIPTOR_TAG_HASHTREE {
                let hashtree = HashtreeDescriptor::parse(desc)?;
                hashtree.check_layout(image_size)?;
                return Ok(Some(Self { footer, header, hashtree }));
            }
            at += len;
        }
        Ok(None)
    }

    /// vbmeta asks for the hash tree to be ignored.
    pub fn hashtree_disabled(&self) -> bool {
        self.header.flags & (VBMETA_FLAG_HASHTREE_DISABLED | VBMETA_FLAG_VERIFICATION_DISABLED) != 0
    }
}
