//! Round-level Reed-Solomon work shared by the reader, the encoder and the
//! recovery scanner.
//!
//! A round is the set of `BLOCK_SIZE` codewords that share the same input
//! blocks: row `i` of round `r` is input block `r + i * rounds`, and byte `j`
//! of that block is symbol `i` of codeword `r * BLOCK_SIZE + j`.  Rows past the
//! end of the input are implicit zeros.

use std::io;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::codec::{Codec, CodecError};
use crate::interleave::Geometry;
use crate::io_stream::source::BlockSource;
use crate::BLOCK_SIZE;

const BS: usize = BLOCK_SIZE as usize;

/// Rows of `round` that map to real input blocks.
pub fn real_rows(geometry: &Geometry, round: u64) -> usize {
    if round >= geometry.blocks {
        return 0;
    }
    let rows = (geometry.blocks - round - 1) / geometry.rounds + 1;
    rows.min(geometry.rsn) as usize
}

/// Input rows and parity of one round.
#[derive(Clone)]
pub struct Round {
    pub index:          u64,
    pub row_count:      usize,
    /// `row_count * BLOCK_SIZE` bytes, row-major.
    pub rows:           Vec<u8>,
    /// `BLOCK_SIZE * roots` bytes; codeword `j` owns `parity[j * roots..]`.
    pub parity:         Vec<u8>,
    /// Rows whose content changed while decoding.
    pub corrected_rows: Vec<bool>,
    pub parity_changed: bool,
    /// Symbols corrected over all codewords.
    pub symbols:        usize,
}

impl Round {
    pub fn row(&self, row: usize) -> &[u8] {
        &self.rows[row * BS..(row + 1) * BS]
    }

    pub fn is_clean(&self) -> bool {
        self.symbols == 0
    }

    pub fn corrected_row_count(&self) -> usize {
        self.corrected_rows.iter().filter(|&&c| c).count()
    }
}

/// Reads every real row of `round` plus its parity from `source`.
///
/// `parity_start` is the byte offset of the parity area.
pub fn read_round<S: BlockSource + ?Sized>(
    source:       &mut S,
    geometry:     &Geometry,
    parity_start: u64,
    round:        u64,
) -> io::Result<Round> {
    let row_count = real_rows(geometry, round);
    let mut rows = vec![0u8; row_count * BS];
    for (i, row) in rows.chunks_mut(BS).enumerate() {
        let block = geometry.block_at(round, i as u64);
        source.read_exact_at(row, block * BLOCK_SIZE)?;
    }
    let mut parity = vec![0u8; geometry.round_parity_len()];
    source.read_exact_at(&mut parity, parity_start + geometry.parity_offset(round))?;

    Ok(Round {
        index: round,
        row_count,
        rows,
        parity,
        corrected_rows: vec![false; row_count],
        parity_changed: false,
        symbols: 0,
    })
}

/// Corrects every codeword of `round` in place.
///
/// `erasures` are row indices known to be damaged.  On error the round may be
/// partially corrected and must be discarded.
pub fn decode_round<C: Codec + ?Sized>(
    codec:    &C,
    geometry: &Geometry,
    round:    &mut Round,
    erasures: &[usize],
) -> Result<usize, CodecError> {
    let rsn = geometry.rsn as usize;
    let roots = usize::from(geometry.roots);
    let mut codeword = vec![0u8; rsn + roots];

    for j in 0..BS {
        codeword.fill(0);
        for i in 0..round.row_count {
            codeword[i] = round.rows[i * BS + j];
        }
        codeword[rsn..].copy_from_slice(&round.parity[j * roots..(j + 1) * roots]);

        let fixed = codec.decode(&mut codeword, erasures)?;
        if fixed == 0 {
            continue;
        }
        round.symbols += fixed;
        for i in 0..round.row_count {
            if round.rows[i * BS + j] != codeword[i] {
                round.rows[i * BS + j] = codeword[i];
                round.corrected_rows[i] = true;
            }
        }
        let parity = &mut round.parity[j * roots..(j + 1) * roots];
        if parity != &codeword[rsn..] {
            parity.copy_from_slice(&codeword[rsn..]);
            round.parity_changed = true;
        }
    }
    Ok(round.symbols)
}

/// Computes the parity of one round from its real rows.
///
/// `rows` holds `row_count` blocks; missing rows encode as zeros.
pub fn encode_round<C: Codec + ?Sized>(
    codec:     &C,
    geometry:  &Geometry,
    rows:      &[u8],
    row_count: usize,
    parity:    &mut [u8],
) -> Result<(), CodecError> {
    let rsn = geometry.rsn as usize;
    let roots = usize::from(geometry.roots);

    // `data` is reused across codewords: only the first `row_count` symbols
    // are ever written, the rest stay zero.
    let encode_one = |data: &mut Vec<u8>, j: usize, out: &mut [u8]| -> Result<(), CodecError> {
        for (i, symbol) in data.iter_mut().enumerate().take(row_count) {
            *symbol = rows[i * BS + j];
        }
        codec.encode(data, out)
    };

    #[cfg(feature = "parallel")]
    {
        parity
            .par_chunks_mut(roots)
            .enumerate()
            .try_for_each_init(|| vec![0u8; rsn], |data, (j, out)| encode_one(data, j, out))
    }
    #[cfg(not(feature = "parallel"))]
    {
        let mut data = vec![0u8; rsn];
        parity.chunks_mut(roots).enumerate().try_for_each(|(j, out)| encode_one(&mut data, j, out))
    }
}
