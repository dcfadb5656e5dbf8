//! Interleaving map and trailer size arithmetic shared by the encoder and
//! the reader.
//!
//! # Layout
//! The protected input is viewed as a grid with `rsn` rows of
//! `rounds * BLOCK_SIZE` bytes.  Codeword `k` takes byte `k` of every row,
//! so row `i` of codeword `k` lives at input offset
//! `k + i * rounds * BLOCK_SIZE`.  Walking the interleaved stream
//! `0, 1, 2, ...` therefore visits the grid column by column:
//!
//! ```text
//!  interleaved index  j = k * rsn + i
//!  input offset          = j / rsn + (j % rsn) * rounds * BLOCK_SIZE
//! ```
//!
//! A whole damaged disk block lands in `BLOCK_SIZE` *different* codewords,
//! one symbol each.
//!
//! All arithmetic is `u64`.  Division truncates toward zero and the exact
//! formula is part of the on-disk format: encoder and decoder must agree to
//! the bit.
//!
//! Every size helper taking `roots` rejects values outside `1..=254` with
//! [`CodecError::InvalidRoots`].

use crate::codec::{CodecError, MAX_ROOTS};
use crate::header::FEC_HEADER_SIZE;
use crate::BLOCK_SIZE;

/// Symbols per Reed-Solomon codeword (`RS(255, 255 - roots)`).
pub const RS_SYMBOLS: u64 = 255;

/// `ceil(x / y)`; `y` must be non-zero.
#[inline]
pub fn div_round_up(x: u64, y: u64) -> u64 {
    x / y + u64::from(x % y != 0)
}

/// `x` rounded up to the next multiple of `y`; `y` must be non-zero.
#[inline]
pub fn round_up(x: u64, y: u64) -> u64 {
    div_round_up(x, y) * y
}

/// Maps an interleaved symbol index to its byte offset in the protected
/// input.
///
/// `rsn` is the number of data symbols per codeword and `rounds` the number
/// of codeword groups (see [`rounds`]).
#[inline]
pub fn interleave(offset: u64, rsn: u64, rounds: u64) -> u64 {
    (offset / rsn) + (offset % rsn) * rounds * BLOCK_SIZE
}

/// Number of `BLOCK_SIZE` codeword groups needed to cover `blocks` input
/// blocks with `rsn` data symbols per codeword.
#[inline]
pub fn rounds(blocks: u64, rsn: u64) -> u64 {
    div_round_up(blocks, rsn)
}

/// Data symbols per codeword for `roots` parity symbols.
pub fn data_symbols(roots: u8) -> Result<u64, CodecError> {
    if roots == 0 || roots > MAX_ROOTS {
        return Err(CodecError::InvalidRoots(roots));
    }
    Ok(RS_SYMBOLS - u64::from(roots))
}

/// Bytes of raw parity (without the header block) protecting `input_size`
/// bytes with `roots` parity symbols per codeword.
pub fn parity_size(input_size: u64, roots: u8) -> Result<u64, CodecError> {
    Ok(Geometry::new(input_size, roots)?.parity_size())
}

/// Total FEC trailer size: parity plus the block-aligned header block.
///
/// `ceil(ceil(input_size / BLOCK_SIZE) / (255 - roots)) * roots * BLOCK_SIZE
///  + round_up(header_size, BLOCK_SIZE)`
pub fn fec_trailer_size(input_size: u64, roots: u8) -> Result<u64, CodecError> {
    Ok(parity_size(input_size, roots)? + round_up(FEC_HEADER_SIZE as u64, BLOCK_SIZE))
}

/// Same as [`fec_trailer_size`] but also refuses inputs whose trailer size
/// does not fit in 64 bits.  `None` for an invalid root count.
pub fn checked_fec_trailer_size(input_size: u64, roots: u8) -> Option<u64> {
    let rsn = data_symbols(roots).ok()?;
    rounds(div_round_up(input_size, BLOCK_SIZE), rsn)
        .checked_mul(u64::from(roots))?
        .checked_mul(BLOCK_SIZE)?
        .checked_add(round_up(FEC_HEADER_SIZE as u64, BLOCK_SIZE))
}

/// Codeword geometry of one protected input, computed once and reused for
/// every block lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub roots:  u8,
    pub rsn:    u64,
    pub blocks: u64,
    pub rounds: u64,
}

impl Geometry {
    pub fn new(input_size: u64, roots: u8) -> Result<Self, CodecError> {
        let rsn = data_symbols(roots)?;
        let blocks = div_round_up(input_size, BLOCK_SIZE);
        Ok(Self { roots, rsn, blocks, rounds: rounds(blocks, rsn) })
    }

    /// Bytes occupied by one round of codewords inside a single grid row.
    #[inline]
    pub fn row_stride(&self) -> u64 {
        self.rounds * BLOCK_SIZE
    }

    /// Round (codeword group) a given input block belongs to.
    #[inline]
    pub fn round_of_block(&self, block: u64) -> u64 {
        block % self.rounds
    }

    /// Row (data symbol index inside each codeword) of a given input block.
    #[inline]
    pub fn row_of_block(&self, block: u64) -> u64 {
        block / self.rounds
    }

    /// Input block holding row `row` of round `round`.
    #[inline]
    pub fn block_at(&self, round: u64, row: u64) -> u64 {
        round + row * self.rounds
    }

    /// Offset of the parity bytes for round `round`, relative to the start of
    /// the parity area.
    #[inline]
    pub fn parity_offset(&self, round: u64) -> u64 {
        round * BLOCK_SIZE * u64::from(self.roots)
    }

    /// Length of one round of parity.
    #[inline]
    pub fn round_parity_len(&self) -> usize {
        BLOCK_SIZE as usize * usize::from(self.roots)
    }

    pub fn parity_size(&self) -> u64 {
        self.rounds * u64::from(self.roots) * BLOCK_SIZE
    }
}
