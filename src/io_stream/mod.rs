//! FEC image reader.
//!
//! # Opening
//! [`FecHandle::open`] reads the final block of the image and parses the FEC
//! header from it (primary copy first, backup copy second).  A missing or
//! malformed trailer downgrades the handle to a pass-through reader unless
//! [`Flags::REQUIRE_ECC`] is set.  Images ending in an AVB footer are read
//! through their hashtree descriptor instead: the FEC header is taken from
//! the end of the FEC region it names, and its tree becomes the verity
//! candidate tried first.  Verity metadata is then searched for below the
//! protected end; when found, its hash tree is verified top-down and the
//! leaf hashes are kept for reads.
//!
//! # Reading
//! Reads are cut into `BLOCK_SIZE` blocks:
//! - with verity, each block is checked against its leaf hash and rebuilt
//!   from parity on mismatch (first without, then with erasures);
//! - with only a FEC trailer, every codeword of the block's round is decoded;
//! - with neither, bytes are returned as stored.
//!
//! A block that cannot be rebuilt fails the read with
//! [`FecError::UncorrectableBlock`]; partially corrected data is never
//! returned.  On the FEC-only path a decoder failure is the only signal, so
//! damage past the code's capacity can go unnoticed (see [`FecHandle::pread`]).
//!
//! # Threading
//! A handle owns one backing store and one cursor and is not meant to be
//! shared between threads without external locking.

pub mod ecc;
pub mod encoder;
mod metadata;
pub mod source;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::avb::AvbImage;
use crate::codec::{get_codec, Codec, CodecError, ReedSolomon};
use crate::hashtree::{HashTreeError, SaltedHasher};
use crate::header::{FecHeader, HeaderError, FEC_HASH_SIZE};
use crate::interleave::Geometry;
use crate::verity::{MetadataFormat, SignatureVerifier, VerityError, VerityMetadata};
use crate::{Flags, BLOCK_SIZE, DEFAULT_ROOTS};

use self::ecc::{decode_round, read_round, Round};
pub use self::source::BlockSource;

const BS: usize = BLOCK_SIZE as usize;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FecError {
    #[error("Malformed FEC trailer: {0}")]
    MalformedTrailer(#[from] HeaderError),
    /// Damage beyond what the parity can repair.
    #[error("Uncorrectable block at offset {offset}")]
    UncorrectableBlock { offset: u64 },
    #[error("Verity signature check failed")]
    SignatureInvalid,
    #[error("Contract violation: {0}")]
    ContractViolation(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Handle is closed")]
    Closed,
}

impl From<CodecError> for FecError {
    fn from(e: CodecError) -> Self {
        FecError::ContractViolation(e.to_string())
    }
}

impl From<HashTreeError> for FecError {
    fn from(e: HashTreeError) -> Self {
        match e {
            HashTreeError::Io(e) => FecError::Io(e),
            other => FecError::ContractViolation(other.to_string()),
        }
    }
}

impl From<VerityError> for FecError {
    fn from(e: VerityError) -> Self {
        match e {
            VerityError::SignatureInvalid => FecError::SignatureInvalid,
            VerityError::Io(e) => FecError::Io(e),
            other => FecError::ContractViolation(other.to_string()),
        }
    }
}

impl From<FecError> for io::Error {
    fn from(e: FecError) -> Self {
        match e {
            FecError::Io(e) => e,
            FecError::ContractViolation(_) => io::Error::new(io::ErrorKind::InvalidInput, e),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    ReadOnly,
    /// Corrected blocks are written back to the backing store.
    ReadWrite,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub mode:          Mode,
    pub flags:         Flags,
    /// Parity symbols per codeword the trailer must have been built with.
    pub roots:         u8,
    /// Byte offset of the verity metadata, bypassing the search.
    pub verity_offset: Option<u64>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { mode: Mode::ReadOnly, flags: Flags::empty(), roots: DEFAULT_ROOTS, verity_offset: None }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn roots(mut self, roots: u8) -> Self {
        self.roots = roots;
        self
    }

    pub fn verity_offset(mut self, offset: u64) -> Self {
        self.verity_offset = Some(offset);
        self
    }
}

// ── Metadata views ───────────────────────────────────────────────────────────

fn serialize_flags<S: Serializer>(flags: &Flags, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u32(flags.bits())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FecStatus {
    #[serde(serialize_with = "serialize_flags")]
    pub flags:     Flags,
    pub mode:      Mode,
    /// Blocks returned with corrected content so far.
    pub errors:    u64,
    /// Readable bytes.
    pub data_size: u64,
    /// Size of the backing store.
    pub size:      u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EccMetadata {
    /// Parity digest in the header matches the stored parity.
    pub valid:  bool,
    pub roots:  u8,
    pub blocks: u64,
    pub rounds: u64,
    /// Byte offset of the parity area.
    pub start:  u64,
}

struct EccState<C> {
    header:   FecHeader,
    geometry: Geometry,
    codec:    C,
    valid:    bool,
}

impl<C> EccState<C> {
    fn parity_start(&self) -> u64 {
        self.header.inp_size
    }
}

/// Verified hash tree of the verity-protected data.
struct TreeState {
    hasher:      SaltedHasher<Sha256>,
    /// Leaf level; the hash of data block `i` is at `i * FEC_HASH_SIZE`.
    leaves:      Vec<u8>,
    data_blocks: u64,
}

impl TreeState {
    fn leaf(&self, block: u64) -> &[u8] {
        let start = block as usize * FEC_HASH_SIZE;
        &self.leaves[start..start + FEC_HASH_SIZE]
    }

    fn check(&self, block: u64, data: &[u8]) -> bool {
        block < self.data_blocks && self.hasher.verify(data, self.leaf(block))
    }

    /// Rows of `round` whose stored content fails its hash.
    fn erasures(&self, geometry: &Geometry, round: &Round) -> Vec<usize> {
        let limit = usize::from(geometry.roots);
        let mut found = Vec::new();
        for i in 0..round.row_count {
            let block = geometry.block_at(round.index, i as u64);
            if block < self.data_blocks && !self.check(block, round.row(i)) {
                found.push(i);
                if found.len() > limit {
                    break;
                }
            }
        }
        found
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

pub struct FecHandle<S: BlockSource = File, C: Codec = ReedSolomon> {
    source:    Option<S>,
    mode:      Mode,
    flags:     Flags,
    size:      u64,
    data_size: u64,
    pos:       u64,
    errors:    u64,
    ecc:       Option<EccState<C>>,
    avb:       Option<AvbImage>,
    verity:    VerityMetadata,
    tree:      Option<TreeState>,
}

impl FecHandle<File, ReedSolomon> {
    /// Opens the image at `path`.
    pub fn open<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self, FecError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(options.mode == Mode::ReadWrite)
            .open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), mode = ?options.mode, "opening image");
        Self::from_source_with_codec(file, options, get_codec)
    }
}

impl<S: BlockSource> FecHandle<S, ReedSolomon> {
    pub fn from_source(source: S, options: OpenOptions) -> Result<Self, FecError> {
        Self::from_source_with_codec(source, options, get_codec)
    }
}

impl<S: BlockSource, C: Codec> FecHandle<S, C> {
    /// Opens an image on `source`, building the codec with `make_codec` once
    /// the root count is known.
    pub fn from_source_with_codec<F>(source: S, options: OpenOptions, make_codec: F) -> Result<Self, FecError>
    where
        F: FnOnce(u8) -> Result<C, CodecError>,
    {
        let mut handle = Self {
            source:    Some(source),
            mode:      options.mode,
            flags:     options.flags,
            size:      0,
            data_size: 0,
            pos:       0,
            errors:    0,
            ecc:       None,
            avb:       None,
            verity:    VerityMetadata::absent(),
            tree:      None,
        };
        handle.size = handle.src()?.size()?;
        handle.avb = handle.find_avb()?;
        handle.load_ecc(options.roots, make_codec)?;
        handle.data_size = match (&handle.ecc, &handle.avb) {
            (Some(ecc), _) => ecc.header.inp_size,
            (None, Some(avb)) => avb.footer.original_image_size,
            (None, None) => handle.size,
        };

        if options.flags.contains(Flags::VERITY_DISABLE) {
            debug!("verity parsing disabled by flag");
        } else {
            handle.load_verity(options.verity_offset)?;
        }
        debug!(
            size = handle.size,
            data_size = handle.data_size,
            ecc = handle.ecc.is_some(),
            verity = handle.tree.is_some(),
            "image ready"
        );
        Ok(handle)
    }

    fn src(&mut self) -> Result<&mut S, FecError> {
        self.source.as_mut().ok_or(FecError::Closed)
    }

    fn ensure_open(&self) -> Result<(), FecError> {
        if self.source.is_some() {
            Ok(())
        } else {
            Err(FecError::Closed)
        }
    }

    fn load_ecc<F>(&mut self, roots: u8, make_codec: F) -> Result<(), FecError>
    where
        F: FnOnce(u8) -> Result<C, CodecError>,
    {
        let strict = self.flags.contains(Flags::REQUIRE_ECC);
        // With AVB the trailer ends where the descriptor's FEC region ends.
        let (size, roots) = match self.avb.as_ref().map(|a| &a.hashtree) {
            Some(ht) if ht.has_fec() => match (ht.fec_end(), ht.fec_roots()) {
                (Some(end), Ok(avb_roots)) => {
                    debug!(end, roots = avb_roots, "FEC region from AVB hashtree descriptor");
                    (end, avb_roots)
                }
                _ => (self.size, roots),
            },
            _ => (self.size, roots),
        };
        if size < BLOCK_SIZE {
            let e = HeaderError::TooSmall(size);
            if strict {
                return Err(e.into());
            }
            debug!(error = %e, "no FEC trailer");
            return Ok(());
        }

        let mut block = vec![0u8; BS];
        self.src()?.read_exact_at(&mut block, size - BLOCK_SIZE)?;
        let (header, backup) = match FecHeader::from_block(&block, roots, size) {
            Ok(found) => found,
            Err(HeaderError::Io(e)) => return Err(e.into()),
            Err(e) if strict => return Err(e.into()),
            Err(e) => {
                debug!(error = %e, "no usable FEC trailer; reading without correction");
                return Ok(());
            }
        };
        if backup {
            warn!("primary FEC header damaged; using backup copy");
        }

        let geometry = header.geometry()?;
        let valid = self.parity_digest(header.inp_size, u64::from(header.fec_size))? == header.hash;
        if !valid {
            warn!("FEC parity digest mismatch; parity may be damaged");
        }
        let codec = make_codec(header.roots_u8())?;
        debug!(roots = header.roots, inp_size = header.inp_size, rounds = geometry.rounds, "FEC trailer found");
        self.ecc = Some(EccState { header, geometry, codec, valid });
        Ok(())
    }

    fn parity_digest(&mut self, start: u64, len: u64) -> Result<[u8; FEC_HASH_SIZE], FecError> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * BS];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(buf.len() as u64) as usize;
            self.src()?.read_exact_at(&mut buf[..n], start + done)?;
            hasher.update(&buf[..n]);
            done += n as u64;
        }
        Ok(hasher.finalize().into())
    }

    // ── Round decoding ───────────────────────────────────────────────────────

    /// Reads and decodes one round.  `Ok(None)` means the round is
    /// uncorrectable with the given erasure policy.
    pub(crate) fn decode_round_at(&mut self, round: u64, use_erasures: bool) -> Result<Option<Round>, FecError> {
        let Some((geometry, parity_start)) = self.ecc.as_ref().map(|e| (e.geometry, e.parity_start())) else {
            return Ok(None);
        };
        let source = self.source.as_mut().ok_or(FecError::Closed)?;
        let mut raw = read_round(source, &geometry, parity_start, round)?;

        let erasures = match (use_erasures, self.tree.as_ref()) {
            (true, Some(tree)) => tree.erasures(&geometry, &raw),
            _ => Vec::new(),
        };
        let Some(ecc) = self.ecc.as_ref() else {
            return Ok(None);
        };
        match decode_round(&ecc.codec, &geometry, &mut raw, &erasures) {
            Ok(symbols) => {
                if symbols > 0 {
                    warn!(round, symbols, erasures = erasures.len(), "corrected RS round");
                }
                Ok(Some(raw))
            }
            Err(e) => {
                debug!(round, erasures = erasures.len(), error = %e, "RS round decoding failed");
                Ok(None)
            }
        }
    }

    pub(crate) fn geometry(&self) -> Option<Geometry> {
        self.ecc.as_ref().map(|e| e.geometry)
    }

    /// Whether every verity-covered row of `round` matches its leaf hash.
    /// Always true without a hash tree.
    pub(crate) fn round_matches_tree(&self, round: &Round) -> bool {
        match (self.tree.as_ref(), self.ecc.as_ref()) {
            (Some(tree), Some(ecc)) => tree.erasures(&ecc.geometry, round).is_empty(),
            _ => true,
        }
    }

    pub(crate) fn has_tree(&self) -> bool {
        self.tree.is_some()
    }

    pub(crate) fn write_back(&mut self, buf: &[u8], offset: u64) -> Result<(), FecError> {
        if self.mode != Mode::ReadWrite {
            return Ok(());
        }
        self.src()?.write_all_at(buf, offset)?;
        debug!(offset, len = buf.len(), "wrote corrected data back");
        Ok(())
    }

    /// Writes every corrected row and, if changed, the parity of `round`.
    pub(crate) fn write_round(&mut self, round: &Round) -> Result<(), FecError> {
        let Some((geometry, parity_start)) = self.ecc.as_ref().map(|e| (e.geometry, e.parity_start())) else {
            return Ok(());
        };
        for i in 0..round.row_count {
            if round.corrected_rows[i] {
                let block = geometry.block_at(round.index, i as u64);
                self.write_back(round.row(i), block * BLOCK_SIZE)?;
            }
        }
        if round.parity_changed {
            self.write_back(&round.parity, parity_start + geometry.parity_offset(round.index))?;
        }
        Ok(())
    }

    /// Rebuilds block `block` from parity and accepts it only if it hashes to
    /// `expected`.
    fn recover_block(
        &mut self,
        block: u64,
        hasher: &SaltedHasher<Sha256>,
        expected: &[u8],
    ) -> Result<Option<Vec<u8>>, FecError> {
        let Some(geometry) = self.geometry() else {
            return Ok(None);
        };
        if block >= geometry.blocks {
            return Ok(None);
        }
        let round = geometry.round_of_block(block);
        let row = geometry.row_of_block(block) as usize;

        for use_erasures in [false, true] {
            if use_erasures && self.tree.is_none() {
                break;
            }
            if let Some(decoded) = self.decode_round_at(round, use_erasures)? {
                if hasher.verify(decoded.row(row), expected) {
                    return Ok(Some(decoded.row(row).to_vec()));
                }
                debug!(block, use_erasures, "decoded block still fails its hash");
            }
        }
        Ok(None)
    }

    /// Reads one hash-checked block, correcting it if needed.
    fn read_verified(
        &mut self,
        block: u64,
        hasher: &SaltedHasher<Sha256>,
        expected: &[u8],
    ) -> Result<Vec<u8>, FecError> {
        let mut data = vec![0u8; BS];
        self.src()?.read_exact_at(&mut data, block * BLOCK_SIZE)?;
        if hasher.verify(&data, expected) {
            return Ok(data);
        }
        if self.ecc.is_none() {
            error!(block, "corrupted block and no FEC data");
            return Err(FecError::UncorrectableBlock { offset: block * BLOCK_SIZE });
        }
        debug!(block, "hash mismatch; trying FEC");
        match self.recover_block(block, hasher, expected)? {
            Some(fixed) => {
                self.errors += 1;
                warn!(block, "corrected block");
                self.write_back(&fixed, block * BLOCK_SIZE)?;
                Ok(fixed)
            }
            None => {
                error!(block, offset = block * BLOCK_SIZE, "corrupted block cannot be recovered");
                Err(FecError::UncorrectableBlock { offset: block * BLOCK_SIZE })
            }
        }
    }

    // ── Read paths ───────────────────────────────────────────────────────────

    fn verity_read(&mut self, buf: &mut [u8], offset: u64) -> Result<(), FecError> {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / BLOCK_SIZE;
            let within = (pos % BLOCK_SIZE) as usize;
            let n = (BS - within).min(buf.len() - done);

            let (hasher, expected) = match self.tree.as_ref() {
                Some(tree) if block < tree.data_blocks => (tree.hasher.clone(), tree.leaf(block).to_vec()),
                _ => return Err(FecError::ContractViolation(format!("block {block} is outside the hash tree"))),
            };
            let data = self.read_verified(block, &hasher, &expected)?;
            buf[done..done + n].copy_from_slice(&data[within..within + n]);
            done += n;
        }
        Ok(())
    }

    fn ecc_read(&mut self, buf: &mut [u8], offset: u64) -> Result<(), FecError> {
        let Some(geometry) = self.geometry() else {
            return self.raw_read(buf, offset);
        };
        let first = offset / BLOCK_SIZE;
        let last = (offset + buf.len() as u64 - 1) / BLOCK_SIZE;

        // Decode each round once, however many requested blocks it holds.
        let mut by_round: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for block in first..=last {
            by_round.entry(geometry.round_of_block(block)).or_default().push(block);
        }

        for (round, blocks) in by_round {
            let Some(decoded) = self.decode_round_at(round, false)? else {
                let offset = blocks[0] * BLOCK_SIZE;
                error!(round, offset, "uncorrectable RS round");
                return Err(FecError::UncorrectableBlock { offset });
            };
            for block in blocks {
                let row = geometry.row_of_block(block) as usize;
                let block_start = block * BLOCK_SIZE;
                let from = offset.max(block_start);
                let to = (offset + buf.len() as u64).min(block_start + BLOCK_SIZE);
                buf[(from - offset) as usize..(to - offset) as usize].copy_from_slice(
                    &decoded.row(row)[(from - block_start) as usize..(to - block_start) as usize],
                );
                if decoded.corrected_rows[row] {
                    self.errors += 1;
                    self.write_back(decoded.row(row), block_start)?;
                }
            }
        }
        Ok(())
    }

    fn raw_read(&mut self, buf: &mut [u8], offset: u64) -> Result<(), FecError> {
        self.src()?.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Reads `buf.len()` bytes at `offset` through the FEC trailer only.  Used
    /// before verity metadata is known.
    pub(crate) fn read_protected(&mut self, buf: &mut [u8], offset: u64) -> Result<(), FecError> {
        if buf.is_empty() {
            return Ok(());
        }
        let protected = self.ecc.as_ref().map_or(0, |e| e.header.inp_size);
        if offset + buf.len() as u64 <= protected {
            self.ecc_read(buf, offset)
        } else {
            self.raw_read(buf, offset)
        }
    }

    // ── Public API ───────────────────────────────────────────────────────────

    /// Reads up to `buf.len()` bytes at `offset` without moving the cursor.
    ///
    /// Without verity, a codeword holding more than `roots / 2` errors can
    /// decode to a different valid codeword, and the wrong bytes are returned
    /// as corrected.  Only reads backed by a verified hash tree re-check every
    /// rebuilt block.  Open with [`Flags::REQUIRE_ECC`] on images that carry
    /// verity metadata when integrity matters.
    pub fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, FecError> {
        self.ensure_open()?;
        if offset >= self.data_size || buf.is_empty() {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(self.data_size - offset) as usize;
        let buf = &mut buf[..count];

        if self.tree.is_some() {
            self.verity_read(buf, offset)?;
        } else if self.ecc.is_some() {
            self.ecc_read(buf, offset)?;
        } else {
            self.raw_read(buf, offset)?;
        }
        Ok(count)
    }

    /// Reads at the cursor and advances it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FecError> {
        let n = self.pread(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Moves the cursor.  Targets past the readable end are clamped to it;
    /// targets before the start are an error.
    pub fn seek(&mut self, target: SeekFrom) -> Result<u64, FecError> {
        self.ensure_open()?;
        let (base, delta) = match target {
            SeekFrom::Start(n) => (n, 0i64),
            SeekFrom::Current(d) => (self.pos, d),
            SeekFrom::End(d) => (self.data_size, d),
        };
        let new = base
            .checked_add_signed(delta)
            .ok_or_else(|| FecError::ContractViolation(format!("seek to {base} {delta:+} is out of range")))?;
        self.pos = new.min(self.data_size);
        Ok(self.pos)
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn get_status(&self) -> Result<FecStatus, FecError> {
        self.ensure_open()?;
        Ok(FecStatus {
            flags:     self.flags,
            mode:      self.mode,
            errors:    self.errors,
            data_size: self.data_size,
            size:      self.size,
        })
    }

    /// ECC metadata, or `None` when the image has no usable FEC trailer.
    pub fn get_ecc_metadata(&self) -> Result<Option<EccMetadata>, FecError> {
        self.ensure_open()?;
        Ok(self.ecc.as_ref().map(|e| EccMetadata {
            valid:  e.valid,
            roots:  e.geometry.roots,
            blocks: e.geometry.blocks,
            rounds: e.geometry.rounds,
            start:  e.parity_start(),
        }))
    }

    /// AVB footer and hashtree descriptor, when the image ends in one.
    pub fn get_avb_metadata(&self) -> Result<Option<&AvbImage>, FecError> {
        self.ensure_open()?;
        Ok(self.avb.as_ref())
    }

    pub fn get_verity_metadata(&self) -> Result<&VerityMetadata, FecError> {
        self.ensure_open()?;
        Ok(&self.verity)
    }

    /// Checks the verity table signature with `verifier`.
    pub fn verify_signature(&self, verifier: &dyn SignatureVerifier) -> Result<(), FecError> {
        self.ensure_open()?;
        Ok(self.verity.verify_signature(verifier)?)
    }

    /// Flips the metadata magic between enabled and disabled.  Needs a
    /// read-write handle with verity metadata.
    pub fn set_verity_status(&mut self, enabled: bool) -> Result<(), FecError> {
        self.ensure_open()?;
        if self.mode != Mode::ReadWrite {
            return Err(FecError::ContractViolation("cannot update verity magic: read-only handle".into()));
        }
        if !self.verity.is_present() {
            return Err(FecError::ContractViolation("cannot update verity magic: no metadata found".into()));
        }
        if self.verity.format == MetadataFormat::Avb {
            return Err(FecError::ContractViolation("cannot update verity magic: AVB keeps it in vbmeta flags".into()));
        }
        let magic = if enabled { crate::verity::VERITY_MAGIC } else { crate::verity::VERITY_MAGIC_DISABLE };
        let offset = self.verity.metadata_start;
        self.src()?.write_all_at(&magic.to_le_bytes(), offset)?;
        self.verity.disabled = !enabled;
        warn!(magic = format_args!("{magic:#010x}"), enabled, "updated verity magic");
        Ok(())
    }

    /// Releases the backing store, syncing it first in read-write mode.
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), FecError> {
        if let Some(mut source) = self.source.take() {
            if self.mode == Mode::ReadWrite {
                source.sync()?;
            }
            debug!(errors = self.errors, "image closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }
}

impl<S: BlockSource, C: Codec> Drop for FecHandle<S, C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to sync image on drop");
        }
    }
}

impl<S: BlockSource, C: Codec> Read for FecHandle<S, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(FecHandle::read(self, buf)?)
    }
}

impl<S: BlockSource, C: Codec> Seek for FecHandle<S, C> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(FecHandle::seek(self, pos)?)
    }
}
