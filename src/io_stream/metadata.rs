//! Verity metadata discovery and hash tree verification for [`FecHandle`].
//!
//! Candidates are tried in order: an explicit offset, the hashtree
//! descriptor of an AVB footer, the end of the protected area, the size law,
//! then the size recorded in an ext4 or squashfs superblock.

use std::io::Cursor;

use sha2::Sha256;
use tracing::{debug, warn};

use super::{FecError, FecHandle, TreeState, BS};
use crate::avb::{AvbError, AvbFooter, AvbImage, AVB_FOOTER_SIZE};
use crate::codec::Codec;
use crate::hashtree::{level_blocks, SaltedHasher};
use crate::header::FEC_HASH_SIZE;
use crate::io_stream::source::BlockSource;
use crate::superblock::FsKind;
use crate::verity::{
    metadata_offset_for, MetadataFormat, VerityHeader, VerityMetadata, VerityTable, RSA_SIGNATURE_SIZE, VERITY_HEADER_SIZE,
    VERITY_MAGIC_DISABLE, VERITY_METADATA_SIZE,
};
use crate::{Flags, BLOCK_SIZE};

struct Found {
    header: VerityHeader,
    text:   String,
    table:  VerityTable,
}

impl<S: BlockSource, C: Codec> FecHandle<S, C> {
    /// Locates and loads verity metadata.  Anything short of an IO error that
    /// goes wrong here leaves the handle without verity.
    pub(super) fn load_verity(&mut self, explicit: Option<u64>) -> Result<(), FecError> {
        if explicit.is_none() && self.load_avb_verity()? {
            return Ok(());
        }
        let candidates = match explicit {
            Some(offset) => vec![offset],
            None => self.verity_candidates()?,
        };
        for offset in candidates {
            if self.load_verity_at(offset)? {
                return Ok(());
            }
        }
        debug!("no verity metadata found");
        Ok(())
    }

    /// Reads the AVB footer at the end of the image and the vbmeta blob it
    /// points at.  vbmeta is read raw: the FEC region it describes is not
    /// known yet.
    pub(super) fn find_avb(&mut self) -> Result<Option<AvbImage>, FecError> {
        if self.size < AVB_FOOTER_SIZE as u64 {
            return Ok(None);
        }
        let mut raw = [0u8; AVB_FOOTER_SIZE];
        self.raw_read(&mut raw, self.size - AVB_FOOTER_SIZE as u64)?;
        let footer = match AvbFooter::parse(&raw).and_then(|f| f.validate(self.size).map(|()| f)) {
            Ok(footer) => footer,
            Err(AvbError::InvalidFooterMagic) => return Ok(None),
            Err(e) => {
                debug!(error = %e, "unusable AVB footer");
                return Ok(None);
            }
        };

        let mut vbmeta = vec![0u8; footer.vbmeta_size as usize];
        self.raw_read(&mut vbmeta, footer.vbmeta_offset)?;
        match AvbImage::parse(footer, &vbmeta, self.size) {
            Ok(Some(image)) => {
                let ht = &image.hashtree;
                debug!(
                    partition = %ht.partition_name,
                    image_size = ht.image_size,
                    tree_offset = ht.tree_offset,
                    fec_offset = ht.fec_offset,
                    roots = ht.fec_num_roots,
                    "AVB hashtree descriptor"
                );
                Ok(Some(image))
            }
            Ok(None) => {
                debug!("vbmeta has no hashtree descriptor");
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "invalid AVB vbmeta; ignoring footer");
                Ok(None)
            }
        }
    }

    /// Verity from the AVB hashtree descriptor, if there is one.
    fn load_avb_verity(&mut self) -> Result<bool, FecError> {
        let Some(avb) = self.avb.as_ref() else {
            return Ok(false);
        };
        let table = match avb.hashtree.to_verity_table() {
            Ok(table) => table,
            Err(e) => {
                debug!(error = %e, "AVB hash tree not usable for verity");
                return Ok(false);
            }
        };
        let disabled = avb.hashtree_disabled();
        let vbmeta_offset = avb.footer.vbmeta_offset;

        let Some(tree) = self.verify_tree(&table)? else {
            warn!(vbmeta_offset, "AVB hash tree failed verification; ignoring it");
            return Ok(false);
        };

        let text = table.to_string();
        let data_size = table.data_size();
        debug!(vbmeta_offset, data_size, disabled, "verity loaded from AVB hashtree descriptor");
        self.verity = VerityMetadata {
            format: MetadataFormat::Avb,
            disabled,
            data_size,
            metadata_start: vbmeta_offset,
            signature: [0u8; RSA_SIGNATURE_SIZE],
            table_length: text.len() as u32,
            table: text,
            parsed: Some(table),
        };
        self.tree = Some(tree);
        self.data_size = data_size;
        Ok(true)
    }

    /// Candidate metadata offsets in the order they are tried.
    fn verity_candidates(&mut self) -> Result<Vec<u64>, FecError> {
        let end = self.data_size;
        let mut out = Vec::new();
        let mut push = |offset: u64, how: &str| {
            if !out.contains(&offset) {
                debug!(offset, how, "verity metadata candidate");
                out.push(offset);
            }
        };

        if end > VERITY_METADATA_SIZE {
            push((end - VERITY_METADATA_SIZE) / BLOCK_SIZE * BLOCK_SIZE, "end of protected area");
        }
        if let Some(offset) = metadata_offset_for(end) {
            push(offset, "size law");
        }

        let hinted = self.flags.intersects(Flags::EXT4 | Flags::SQUASH);
        let kinds = [(FsKind::Ext4, Flags::EXT4), (FsKind::Squashfs, Flags::SQUASH)];
        for (kind, flag) in kinds {
            if hinted && !self.flags.contains(flag) {
                continue;
            }
            let (at, len) = kind.superblock_range();
            if at + len as u64 > end {
                continue;
            }
            let mut sb = vec![0u8; len];
            match self.read_protected(&mut sb, at) {
                Ok(()) => {}
                Err(FecError::UncorrectableBlock { .. }) => continue,
                Err(e) => return Err(e),
            }
            match kind.filesystem_size(&sb) {
                Ok(size) if size < end => push(size, "filesystem size"),
                Ok(size) => debug!(?kind, size, "filesystem larger than image"),
                Err(e) => debug!(?kind, error = %e, "no superblock"),
            }
        }
        Ok(out)
    }

    /// Reads `buf` raw first; when `accept` rejects the raw bytes, reads it
    /// again through the FEC trailer.  `Ok(None)` means neither was accepted.
    fn read_with_fallback<T, F>(&mut self, buf: &mut [u8], offset: u64, mut accept: F) -> Result<Option<T>, FecError>
    where
        F: FnMut(&[u8]) -> Result<T, String>,
    {
        self.raw_read(buf, offset)?;
        let raw_err = match accept(buf) {
            Ok(v) => return Ok(Some(v)),
            Err(e) => e,
        };
        if self.ecc.is_none() {
            debug!(offset, error = %raw_err, "rejected metadata");
            return Ok(None);
        }
        match self.read_protected(buf, offset) {
            Ok(()) => {}
            Err(FecError::UncorrectableBlock { .. }) => return Ok(None),
            Err(e) => return Err(e),
        }
        match accept(buf) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                debug!(offset, raw = %raw_err, corrected = %e, "rejected metadata");
                Ok(None)
            }
        }
    }

    fn parse_metadata_at(&mut self, offset: u64) -> Result<Option<Found>, FecError> {
        let data_size = self.data_size;
        if data_size <= VERITY_METADATA_SIZE || offset > data_size - VERITY_METADATA_SIZE {
            debug!(offset, "verity header offset is too far");
            return Ok(None);
        }

        let mut raw = [0u8; VERITY_HEADER_SIZE];
        self.raw_read(&mut raw, offset)?;
        let raw_header = VerityHeader::read(&raw[..])?;
        // Decoding would turn the disable magic back into the enabled one.
        let disabled = raw_header.magic == VERITY_MAGIC_DISABLE;

        let mut bytes = [0u8; VERITY_HEADER_SIZE];
        let parse = |b: &[u8]| -> Result<VerityHeader, String> {
            let h = VerityHeader::read(b).map_err(|e| e.to_string())?;
            h.validate(offset, data_size).map_err(|e| e.to_string())?;
            Ok(h)
        };
        let Some(mut header) = self.read_with_fallback(&mut bytes, offset, parse)? else {
            return Ok(None);
        };
        if header != raw_header {
            if !disabled && header.magic != raw_header.magic {
                warn!("corrected verity header magic");
            }
            if header.version != raw_header.version {
                warn!("corrected verity header version");
            }
            if header.length != raw_header.length {
                warn!("corrected verity header length");
            }
            if header.signature != raw_header.signature {
                warn!("corrected verity header signature");
            }
        }
        if disabled {
            header.magic = VERITY_MAGIC_DISABLE;
        }

        let max_blocks = data_size / BLOCK_SIZE;
        let mut table_bytes = vec![0u8; header.length as usize];
        let parse = |b: &[u8]| VerityTable::from_bytes(b, max_blocks).map_err(|e| e.to_string());
        let table_offset = offset + VERITY_HEADER_SIZE as u64;
        let Some((text, table)) = self.read_with_fallback(&mut table_bytes, table_offset, parse)? else {
            return Ok(None);
        };
        debug!(offset, table = %text, "verity table");

        let hash_start = table.hash_start();
        if hash_start >= data_size {
            debug!(hash_start, data_size, "verity hash tree starts past the data");
            return Ok(None);
        }
        let covered = offset.min(hash_start);
        if table.data_size() != covered || table.data_blocks == 0 {
            debug!(data_blocks = table.data_blocks, covered, "verity table does not match its location");
            return Ok(None);
        }
        if table.salt.len() != FEC_HASH_SIZE {
            debug!(salt = table.salt.len(), "unsupported verity salt length");
            return Ok(None);
        }
        Ok(Some(Found { header, text, table }))
    }

    fn load_verity_at(&mut self, offset: u64) -> Result<bool, FecError> {
        let errors = self.errors;
        let Some(found) = self.parse_metadata_at(offset)? else {
            return Ok(false);
        };

        let Some(tree) = self.verify_tree(&found.table)? else {
            warn!(offset, "verity hash tree failed verification; ignoring verity metadata");
            return Ok(false);
        };

        if self.errors > errors {
            if let Err(e) = self.rewrite_metadata(offset, &found) {
                warn!(error = %e, "failed to rewrite verity metadata");
            }
        }

        let data_size = found.table.data_size();
        debug!(offset, data_size, disabled = found.header.is_disabled(), "verity metadata loaded");
        self.verity = VerityMetadata {
            format:         MetadataFormat::Legacy,
            disabled:       found.header.is_disabled(),
            data_size,
            metadata_start: offset,
            signature:      found.header.signature,
            table:          found.text,
            table_length:   found.header.length,
            parsed:         Some(found.table),
        };
        self.tree = Some(tree);
        self.data_size = data_size;
        Ok(true)
    }

    fn rewrite_metadata(&mut self, offset: u64, found: &Found) -> Result<(), FecError> {
        let mut block = vec![0u8; VERITY_METADATA_SIZE as usize];
        found.header.write(Cursor::new(&mut block[..]))?;
        let start = VERITY_HEADER_SIZE;
        block[start..start + found.text.len()].copy_from_slice(found.text.as_bytes());
        self.write_back(&block, offset)
    }

    /// Verifies the stored tree top-down against the root digest and returns
    /// the verified leaf level.
    fn verify_tree(&mut self, table: &VerityTable) -> Result<Option<TreeState>, FecError> {
        let hasher = SaltedHasher::<Sha256>::new(&table.salt);
        let levels = level_blocks(table.data_size(), BLOCK_SIZE, FEC_HASH_SIZE as u64);
        let total: u64 = levels.iter().sum();
        if table.hash_start() + total * BLOCK_SIZE > self.size {
            debug!(hash_start = table.hash_start(), blocks = total, "hash tree runs past the image");
            return Ok(None);
        }

        let mut starts = vec![0u64; levels.len()];
        let mut next = table.hash_start();
        for level in (0..levels.len()).rev() {
            starts[level] = next;
            next += levels[level] * BLOCK_SIZE;
        }

        let mut parent = table.root_digest.to_vec();
        for level in (0..levels.len()).rev() {
            let mut bytes = Vec::with_capacity(levels[level] as usize * BS);
            for i in 0..levels[level] {
                let at = i as usize * FEC_HASH_SIZE;
                let expected = &parent[at..at + FEC_HASH_SIZE];
                let block = (starts[level] + i * BLOCK_SIZE) / BLOCK_SIZE;
                match self.read_verified(block, &hasher, expected) {
                    Ok(data) => bytes.extend_from_slice(&data),
                    Err(FecError::UncorrectableBlock { offset }) => {
                        warn!(level, offset, "hash tree block is corrupted");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
            parent = bytes;
        }
        debug!(levels = levels.len(), data_blocks = table.data_blocks, "hash tree verified");

        Ok(Some(TreeState { hasher, leaves: parent, data_blocks: table.data_blocks }))
    }
}
