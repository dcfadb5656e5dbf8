//! Streaming Merkle tree builder for dm-verity style hash trees.
//!
//! # Shape
//! Input is cut into `block_size` blocks.  Level 0 holds `H(salt || block)`
//! for every input block.  Each level is packed into `block_size` pages of
//! `block_size / hash_size` hashes; unused slots in the last page are filled
//! with the zero-block hash.  Hashing every page of a level gives the next
//! level, until a level fits in a single page.  The root hash is the hash of
//! that top page.
//!
//! # On-disk order
//! Levels are written top-down: the single top page first, the leaf level
//! last.  [`HashTreeBuilder::calculate_size`] gives the exact byte count
//! without hashing anything.
//!
//! # Lifecycle
//! `initialize -> update* -> build -> write_to*`.  Unwritten trailing blocks
//! of the declared input size hash as zero blocks.

pub mod digest;

use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use sha2::digest::Digest;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::interleave::div_round_up;
pub use self::digest::SaltedHasher;

#[derive(Error, Debug)]
pub enum HashTreeError {
    #[error("Invalid block size {block_size} for {hash_size}-byte digests")]
    InvalidBlockSize { block_size: usize, hash_size: usize },
    #[error("Salt must be {expected} bytes, got {found}")]
    InvalidSalt { expected: usize, found: usize },
    #[error("Input size must be non-zero")]
    EmptyInput,
    #[error("Builder is not initialized")]
    NotInitialized,
    #[error("Input exceeds the declared size: {consumed} + {len} > {expected}")]
    SizeExceeded { consumed: u64, len: u64, expected: u64 },
    #[error("Only the final update may be shorter than a block")]
    UnalignedUpdate,
    #[error("Hash tree has not been built")]
    NotBuilt,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Blocks in tree level `level` (0 = leaf hashes) for `data_size` input bytes.
pub fn verity_tree_blocks(data_size: u64, block_size: u64, hash_size: u64, level: usize) -> u64 {
    let hashes_per_block = div_round_up(block_size, hash_size);
    let mut level_blocks = div_round_up(data_size, block_size);
    for _ in 0..=level {
        level_blocks = div_round_up(level_blocks, hashes_per_block);
    }
    level_blocks
}

/// Blocks per tree level, leaf level first.
pub fn level_blocks(data_size: u64, block_size: u64, hash_size: u64) -> Vec<u64> {
    let mut levels = Vec::new();
    loop {
        let blocks = verity_tree_blocks(data_size, block_size, hash_size, levels.len());
        levels.push(blocks);
        if blocks <= 1 {
            break;
        }
    }
    levels
}

/// Total on-disk tree size in bytes.
pub fn tree_size(data_size: u64, block_size: u64, hash_size: u64) -> u64 {
    level_blocks(data_size, block_size, hash_size).iter().sum::<u64>() * block_size
}

pub struct HashTreeBuilder<D: Digest + Clone = Sha256> {
    block_size:      usize,
    hash_size:       usize,
    data_size:       u64,
    consumed:        u64,
    short_tail:      bool,
    salt:            Vec<u8>,
    hasher:          Option<SaltedHasher<D>>,
    zero_block_hash: Vec<u8>,
    /// Leaf hashes in input order, unpadded.
    leaves:          Vec<u8>,
    /// Packed pages per level; `verity_tree[0]` covers the input blocks.
    verity_tree:     Vec<Vec<u8>>,
    root_hash:       Option<Vec<u8>>,
}

impl<D: Digest + Clone> HashTreeBuilder<D> {
    pub fn new(block_size: usize) -> Result<Self, HashTreeError> {
        let hash_size = SaltedHasher::<D>::output_size();
        if !block_size.is_power_of_two() || block_size < 2 * hash_size {
            return Err(HashTreeError::InvalidBlockSize { block_size, hash_size });
        }
        Ok(Self {
            block_size,
            hash_size,
            data_size: 0,
            consumed: 0,
            short_tail: false,
            salt: Vec::new(),
            hasher: None,
            zero_block_hash: Vec::new(),
            leaves: Vec::new(),
            verity_tree: Vec::new(),
            root_hash: None,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn zero_block_hash(&self) -> &[u8] {
        &self.zero_block_hash
    }

    pub fn root_hash(&self) -> Option<&[u8]> {
        self.root_hash.as_deref()
    }

    /// Packed pages of every level, leaf level first.
    pub fn levels(&self) -> &[Vec<u8>] {
        &self.verity_tree
    }

    fn hashes_per_block(&self) -> usize {
        self.block_size / self.hash_size
    }

    /// Tree size in bytes for `input_size` bytes of data.
    pub fn calculate_size(&self, input_size: u64) -> u64 {
        tree_size(input_size, self.block_size as u64, self.hash_size as u64)
    }

    /// Starts a new build.  On error the builder keeps its previous state.
    pub fn initialize(&mut self, expected_data_size: u64, salt: &[u8]) -> Result<(), HashTreeError> {
        if salt.len() != self.hash_size {
            return Err(HashTreeError::InvalidSalt { expected: self.hash_size, found: salt.len() });
        }
        if expected_data_size == 0 {
            return Err(HashTreeError::EmptyInput);
        }

        let hasher = SaltedHasher::<D>::new(salt);
        self.zero_block_hash = hasher.zero_block(self.block_size);
        self.hasher = Some(hasher);
        self.salt = salt.to_vec();
        self.data_size = expected_data_size;
        self.consumed = 0;
        self.short_tail = false;
        let leaf_blocks = verity_tree_blocks(expected_data_size, self.block_size as u64, self.hash_size as u64, 0);
        self.leaves = Vec::with_capacity(leaf_blocks as usize * self.block_size);
        self.verity_tree.clear();
        self.root_hash = None;
        debug!(data_size = expected_data_size, block_size = self.block_size, "hash tree initialized");
        Ok(())
    }

    fn check_append(&self, len: u64) -> Result<(), HashTreeError> {
        if self.hasher.is_none() {
            return Err(HashTreeError::NotInitialized);
        }
        if self.short_tail {
            return Err(HashTreeError::UnalignedUpdate);
        }
        if self.consumed + len > self.data_size {
            return Err(HashTreeError::SizeExceeded { consumed: self.consumed, len, expected: self.data_size });
        }
        Ok(())
    }

    /// Hashes `data` into the leaf level.  Every call but the last must be a
    /// whole number of blocks; a short final block is zero-padded.
    pub fn update(&mut self, data: &[u8]) -> Result<(), HashTreeError> {
        self.check_append(data.len() as u64)?;
        let Some(hasher) = self.hasher.as_ref() else {
            return Err(HashTreeError::NotInitialized);
        };

        for chunk in data.chunks(self.block_size) {
            self.leaves.extend_from_slice(&hasher.hash_padded(chunk, self.block_size));
        }
        self.consumed += data.len() as u64;
        self.short_tail = data.len() % self.block_size != 0;
        self.root_hash = None;
        Ok(())
    }

    /// Appends `len` bytes of zeros without hashing them.
    pub fn update_zeroes(&mut self, len: u64) -> Result<(), HashTreeError> {
        self.check_append(len)?;
        let blocks = div_round_up(len, self.block_size as u64);
        for _ in 0..blocks {
            self.leaves.extend_from_slice(&self.zero_block_hash);
        }
        self.consumed += len;
        self.short_tail = len % self.block_size as u64 != 0;
        self.root_hash = None;
        Ok(())
    }

    /// Packs `hashes` into whole pages, padding with the zero-block hash.
    fn pad_level(&self, hashes: &mut Vec<u8>) {
        let per_page = self.hashes_per_block();
        let count = hashes.len() / self.hash_size;
        let pages = div_round_up(count as u64, per_page as u64).max(1) as usize;
        for _ in count..pages * per_page {
            hashes.extend_from_slice(&self.zero_block_hash);
        }
        // Slack left when the digest size does not divide the block size.
        hashes.resize(pages * self.block_size, 0);
    }

    /// Builds every level above the leaves and the root hash.
    pub fn build(&mut self) -> Result<(), HashTreeError> {
        let hasher = self.hasher.clone().ok_or(HashTreeError::NotInitialized)?;

        // Blocks never handed to update() hash as zero blocks.
        let expected_leaves = div_round_up(self.data_size, self.block_size as u64) as usize;
        let mut level0 = Vec::with_capacity(expected_leaves * self.hash_size);
        level0.extend_from_slice(&self.leaves);
        while level0.len() < expected_leaves * self.hash_size {
            level0.extend_from_slice(&self.zero_block_hash);
        }
        self.pad_level(&mut level0);
        self.verity_tree = vec![level0];

        loop {
            let current = self.verity_tree.last().map(Vec::as_slice).unwrap_or_default();
            if current.len() <= self.block_size {
                let root = hasher.hash(current);
                debug!(levels = self.verity_tree.len(), root = %hex::encode(&root), "hash tree built");
                self.root_hash = Some(root);
                return Ok(());
            }
            let mut next = Vec::with_capacity(current.len() / self.hashes_per_block());
            for page in current.chunks(self.block_size) {
                next.extend_from_slice(&hasher.hash(page));
            }
            self.pad_level(&mut next);
            self.verity_tree.push(next);
        }
    }

    /// All levels concatenated top-down.
    pub fn tree_bytes(&self) -> Result<Vec<u8>, HashTreeError> {
        if self.root_hash.is_none() {
            return Err(HashTreeError::NotBuilt);
        }
        let mut out = Vec::with_capacity(self.verity_tree.iter().map(Vec::len).sum());
        for level in self.verity_tree.iter().rev() {
            out.extend_from_slice(level);
        }
        Ok(out)
    }

    /// Writes the tree top-down at byte `offset` of `sink`; returns the number
    /// of bytes written.
    pub fn write_to<W: Write + Seek>(&self, sink: &mut W, offset: u64) -> Result<u64, HashTreeError> {
        if self.root_hash.is_none() {
            return Err(HashTreeError::NotBuilt);
        }
        sink.seek(SeekFrom::Start(offset))?;
        let mut written = 0u64;
        for level in self.verity_tree.iter().rev() {
            sink.write_all(level)?;
            written += level.len() as u64;
        }
        sink.flush()?;
        Ok(written)
    }

    /// Writes the tree to a new file at `path`.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<u64, HashTreeError> {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        self.write_to(&mut file, 0)
    }
}
