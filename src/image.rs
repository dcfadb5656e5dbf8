//! High-level [`ImageBuilder`] API: turns a block-aligned data image into a
//! verity + FEC protected image.
//!
//! ```no_run
//! use verity_fec::image::{ImageBuilder, ImageOptions};
//! use verity_fec::io_stream::{FecHandle, OpenOptions};
//!
//! let built = ImageBuilder::new(ImageOptions::default())?.build_file("system.img")?;
//! println!("root {}", built.root_digest);
//!
//! let mut image = FecHandle::open("system.img", OpenOptions::default())?;
//! assert!(image.get_verity_metadata()?.is_present());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Layout
//!
//! | Region | Offset | Size |
//! |--------|--------|------|
//! | data | 0 | `data_size` |
//! | verity metadata | `data_size` | 32 KiB |
//! | hash tree | `data_size + 32 KiB` | `tree_size(data_size)` |
//! | FEC parity | end of hash tree | `rounds * roots * 4096` |
//! | FEC header block | end of parity | 4096 |
//!
//! The FEC parity protects everything before it, metadata and tree included.

use std::fs::OpenOptions as FsOpenOptions;
use std::path::Path;

use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, info};

use crate::codec::get_codec;
use crate::hashtree::{HashTreeBuilder, HashTreeError};
use crate::interleave::fec_trailer_size;
use crate::io_stream::encoder::{EncodeOptions, FecEncoder};
use crate::io_stream::source::BlockSource;
use crate::io_stream::FecError;
use crate::verity::table::VERITY_DIGEST_SIZE;
use crate::verity::{build_metadata, VerityTable, RSA_SIGNATURE_SIZE, VERITY_METADATA_SIZE};
use crate::{BLOCK_SIZE, DEFAULT_ROOTS};

/// Blocks hashed per read while building the tree.
const CHUNK_BLOCKS: usize = 64;

// ── ImageOptions ──────────────────────────────────────────────────────────────

/// Configuration for [`ImageBuilder`].
#[derive(Debug, Clone)]
pub struct ImageOptions {
    pub roots:       u8,
    pub salt:        [u8; VERITY_DIGEST_SIZE],
    /// Device names written into the verity table.
    pub data_device: String,
    pub hash_device: String,
    /// Signature over the table, produced out of band.
    pub signature:   Option<[u8; RSA_SIGNATURE_SIZE]>,
    /// Write the metadata with the disable magic.
    pub disabled:    bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            roots:       DEFAULT_ROOTS,
            salt:        [0u8; VERITY_DIGEST_SIZE],
            data_device: "/dev/block/data".into(),
            hash_device: "/dev/block/data".into(),
            signature:   None,
            disabled:    false,
        }
    }
}

// ── ImageLayout ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageLayout {
    pub data_size:       u64,
    pub metadata_offset: u64,
    pub hash_offset:     u64,
    pub hash_size:       u64,
    /// Start of the FEC parity; also the FEC-protected size.
    pub fec_offset:      u64,
    /// Parity plus header block.
    pub fec_size:        u64,
    pub total_size:      u64,
}

/// Result of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuiltImage {
    pub layout:      ImageLayout,
    pub root_digest: String,
    pub table:       String,
}

// ── ImageBuilder ──────────────────────────────────────────────────────────────

pub struct ImageBuilder {
    options: ImageOptions,
}

impl ImageBuilder {
    pub fn new(options: ImageOptions) -> Result<Self, FecError> {
        get_codec(options.roots)?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &ImageOptions {
        &self.options
    }

    /// Where every region of the finished image goes for `data_size` bytes of
    /// data.
    pub fn layout(&self, data_size: u64) -> Result<ImageLayout, FecError> {
        if data_size == 0 || data_size % BLOCK_SIZE != 0 {
            return Err(FecError::ContractViolation(format!(
                "data size {data_size} is not a non-zero multiple of {BLOCK_SIZE}"
            )));
        }
        let hash_size = HashTreeBuilder::<Sha256>::new(BLOCK_SIZE as usize)?.calculate_size(data_size);
        let metadata_offset = data_size;
        let hash_offset = metadata_offset + VERITY_METADATA_SIZE;
        let fec_offset = hash_offset + hash_size;
        let fec_size = fec_trailer_size(fec_offset, self.options.roots)?;
        Ok(ImageLayout {
            data_size,
            metadata_offset,
            hash_offset,
            hash_size,
            fec_offset,
            fec_size,
            total_size: fec_offset + fec_size,
        })
    }

    /// Appends metadata, hash tree and FEC trailer to the data already in
    /// `target`.
    pub fn build<S: BlockSource + ?Sized>(&self, target: &mut S) -> Result<BuiltImage, FecError> {
        let layout = self.layout(target.size()?)?;
        let bs = BLOCK_SIZE as usize;

        let mut tree = HashTreeBuilder::<Sha256>::new(bs)?;
        tree.initialize(layout.data_size, &self.options.salt)?;
        let mut chunk = vec![0u8; CHUNK_BLOCKS * bs];
        let mut offset = 0u64;
        while offset < layout.data_size {
            let n = (layout.data_size - offset).min(chunk.len() as u64) as usize;
            target.read_exact_at(&mut chunk[..n], offset)?;
            if chunk[..n].iter().all(|&b| b == 0) {
                tree.update_zeroes(n as u64)?;
            } else {
                tree.update(&chunk[..n])?;
            }
            offset += n as u64;
        }
        tree.build()?;

        let mut root_digest = [0u8; VERITY_DIGEST_SIZE];
        root_digest.copy_from_slice(tree.root_hash().ok_or(HashTreeError::NotBuilt)?);
        let table = VerityTable {
            data_device: self.options.data_device.clone(),
            hash_device: self.options.hash_device.clone(),
            data_blocks: layout.data_size / BLOCK_SIZE,
            hash_start_block: layout.hash_offset / BLOCK_SIZE,
            root_digest,
            salt: self.options.salt.to_vec(),
            extra: Vec::new(),
        };

        let metadata = build_metadata(&table, self.options.signature.as_ref(), self.options.disabled)?;
        target.write_all_at(&metadata, layout.metadata_offset)?;
        target.write_all_at(&tree.tree_bytes()?, layout.hash_offset)?;
        debug!(hash_offset = layout.hash_offset, hash_size = layout.hash_size, "wrote verity metadata and hash tree");

        let encoder = FecEncoder::new(EncodeOptions { roots: self.options.roots })?;
        encoder.append_trailer(target)?;

        let built = BuiltImage { layout, root_digest: hex::encode(root_digest), table: table.to_string() };
        info!(total = layout.total_size, root = %built.root_digest, "built protected image");
        Ok(built)
    }

    /// Builds the image at `path` in place.
    pub fn build_file<P: AsRef<Path>>(&self, path: P) -> Result<BuiltImage, FecError> {
        let mut file = FsOpenOptions::new().read(true).write(true).open(path)?;
        self.build(&mut file)
    }
}
