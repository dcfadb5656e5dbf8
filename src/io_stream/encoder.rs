//! FEC trailer encoder.
//!
//! The trailer appended to a block-aligned input is
//!
//! ```text
//! [ parity: rounds * roots * BLOCK_SIZE ][ header block: header .. zeros .. header ]
//! ```
//!
//! Parity is produced round by round; round `r` occupies
//! `roots * BLOCK_SIZE` bytes at `r * roots * BLOCK_SIZE`.  The header hash is
//! the SHA-256 of the parity bytes.

use sha2::{Digest, Sha256};
use tracing::debug;

use super::ecc::{encode_round, real_rows};
use super::source::BlockSource;
use super::FecError;
use crate::codec::{get_codec, Codec, ReedSolomon};
use crate::header::FecHeader;
use crate::interleave::{fec_trailer_size, Geometry};
use crate::{BLOCK_SIZE, DEFAULT_ROOTS};

const BS: usize = BLOCK_SIZE as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub roots: u8,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self { roots: DEFAULT_ROOTS }
    }
}

pub struct FecEncoder<C: Codec = ReedSolomon> {
    codec: C,
}

impl FecEncoder<ReedSolomon> {
    pub fn new(options: EncodeOptions) -> Result<Self, FecError> {
        Ok(Self { codec: get_codec(options.roots)? })
    }
}

impl<C: Codec> FecEncoder<C> {
    pub fn with_codec(codec: C) -> Self {
        Self { codec }
    }

    pub fn roots(&self) -> u8 {
        self.codec.roots()
    }

    /// Bytes the trailer for `input_size` bytes of input will take.
    pub fn trailer_size(&self, input_size: u64) -> Result<u64, FecError> {
        Ok(fec_trailer_size(input_size, self.roots())?)
    }

    fn check_input(&self, inp_size: u64) -> Result<Geometry, FecError> {
        if inp_size == 0 || inp_size % BLOCK_SIZE != 0 {
            return Err(FecError::ContractViolation(format!(
                "input size {inp_size} is not a non-zero multiple of {BLOCK_SIZE}"
            )));
        }
        let geometry = Geometry::new(inp_size, self.roots())?;
        if u32::try_from(geometry.parity_size()).is_err() {
            return Err(FecError::ContractViolation(format!("input size {inp_size} needs too much parity")));
        }
        Ok(geometry)
    }

    /// Encodes every round.  `read(buf, offset)` fills `buf` from the input;
    /// `write(parity, offset)` stores one round of parity at `offset` within
    /// the parity area.
    fn encode_rounds<R, W>(&self, inp_size: u64, mut read: R, mut write: W) -> Result<FecHeader, FecError>
    where
        R: FnMut(&mut [u8], u64) -> Result<(), FecError>,
        W: FnMut(&[u8], u64) -> Result<(), FecError>,
    {
        let geometry = self.check_input(inp_size)?;
        let mut digest = Sha256::new();
        let mut rows = vec![0u8; geometry.rsn as usize * BS];
        let mut parity = vec![0u8; geometry.round_parity_len()];

        for round in 0..geometry.rounds {
            let row_count = real_rows(&geometry, round);
            for (i, row) in rows.chunks_mut(BS).take(row_count).enumerate() {
                read(row, geometry.block_at(round, i as u64) * BLOCK_SIZE)?;
            }
            encode_round(&self.codec, &geometry, &rows[..row_count * BS], row_count, &mut parity)?;
            digest.update(&parity);
            write(&parity, geometry.parity_offset(round))?;
        }

        let fec_size = geometry.parity_size() as u32;
        debug!(inp_size, roots = geometry.roots, rounds = geometry.rounds, fec_size, "encoded FEC parity");
        Ok(FecHeader::new(geometry.roots, fec_size, inp_size, digest.finalize().into()))
    }

    /// Returns the complete trailer for `data`.
    pub fn encode_bytes(&self, data: &[u8]) -> Result<Vec<u8>, FecError> {
        let inp_size = data.len() as u64;
        let mut out = Vec::with_capacity(self.trailer_size(inp_size)? as usize);
        let header = self.encode_rounds(
            inp_size,
            |buf, offset| {
                let start = offset as usize;
                buf.copy_from_slice(&data[start..start + buf.len()]);
                Ok(())
            },
            |parity, _| {
                out.extend_from_slice(parity);
                Ok(())
            },
        )?;
        out.extend_from_slice(&header.to_block());
        Ok(out)
    }

    /// Encodes the whole of `target` and appends the trailer to it.
    pub fn append_trailer<S: BlockSource + ?Sized>(&self, target: &mut S) -> Result<FecHeader, FecError> {
        let inp_size = target.size()?;
        self.check_input(inp_size)?;

        let mut parity_rounds: Vec<(u64, Vec<u8>)> = Vec::new();
        let header = {
            let read = |buf: &mut [u8], offset: u64| -> Result<(), FecError> {
                target.read_exact_at(buf, offset)?;
                Ok(())
            };
            // `read` holds the only borrow of `target`; parity is written after.
            self.encode_rounds(inp_size, read, |parity, offset| {
                parity_rounds.push((offset, parity.to_vec()));
                Ok(())
            })?
        };
        for (offset, parity) in &parity_rounds {
            target.write_all_at(parity, inp_size + offset)?;
        }
        target.write_all_at(&header.to_block(), inp_size + u64::from(header.fec_size))?;
        target.sync()?;
        debug!(inp_size, trailer = u64::from(header.fec_size) + BLOCK_SIZE, "appended FEC trailer");
        Ok(header)
    }
}
