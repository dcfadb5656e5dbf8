//! Round-by-round scanner.
//!
//! # How it works
//!
//! Every round `0..rounds` is read and decoded on its own:
//!
//! 1. decode without erasures;
//! 2. if that fails and a verified hash tree is loaded, decode again with the
//!    rows that fail their leaf hash marked as erasures;
//! 3. a decoded round whose verity-covered rows still fail their hashes is
//!    treated as uncorrectable.
//!
//! Uncorrectable rounds are reported, never written.  Only IO errors abort
//! the scan.
//!
//! ## Progress
//!
//! `scan()` and `repair()` accept an optional callback called after every
//! round with `(rounds_done, total_rounds)`.

use std::path::Path;

use tracing::{debug, info, warn};

use super::{RecoveryQuality, RecoveryReport, RoundHealth, ScannedRound};
use crate::codec::Codec;
use crate::io_stream::ecc::real_rows;
use crate::io_stream::source::BlockSource;
use crate::io_stream::{FecError, FecHandle, Mode, OpenOptions};

pub type ProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

fn run<S, C>(
    handle: &mut FecHandle<S, C>,
    write_back: bool,
    mut progress: Option<&mut ProgressFn<'_>>,
) -> Result<RecoveryReport, FecError>
where
    S: BlockSource,
    C: Codec,
{
    let Some(geometry) = handle.geometry() else {
        debug!("no FEC trailer; nothing to scan");
        return Ok(RecoveryReport::unprotected());
    };

    let mut report = RecoveryReport::unprotected();
    report.total_rounds = geometry.rounds;
    report.repaired = write_back;

    for round in 0..geometry.rounds {
        let mut decoded = handle.decode_round_at(round, false)?;
        if decoded.is_none() && handle.has_tree() {
            decoded = handle.decode_round_at(round, true)?;
        }
        let decoded = decoded.filter(|r| handle.round_matches_tree(r));

        let health = match &decoded {
            None => RoundHealth::Uncorrectable,
            Some(r) if r.is_clean() => RoundHealth::Healthy,
            Some(r) => RoundHealth::Corrected { blocks: r.corrected_row_count(), symbols: r.symbols },
        };
        match &health {
            RoundHealth::Healthy => report.healthy_rounds += 1,
            RoundHealth::Corrected { blocks, symbols } => {
                report.corrected_rounds += 1;
                report.corrected_blocks += *blocks as u64;
                report.corrected_symbols += *symbols as u64;
            }
            RoundHealth::Uncorrectable => {
                report.uncorrectable_rounds += 1;
                warn!(round, "round cannot be recovered");
            }
        }

        if let Some(r) = decoded.as_ref().filter(|r| write_back && !r.is_clean()) {
            handle.write_round(r)?;
        }
        if health != RoundHealth::Healthy {
            let blocks = (0..real_rows(&geometry, round)).map(|i| geometry.block_at(round, i as u64)).collect();
            report.round_log.push(ScannedRound { round, blocks, health });
        }
        if let Some(cb) = progress.as_mut() {
            cb(round + 1, geometry.rounds);
        }
    }

    report.quality = match (report.uncorrectable_rounds, report.corrected_rounds) {
        (0, 0) => RecoveryQuality::Intact,
        (0, _) => RecoveryQuality::Correctable,
        _ => RecoveryQuality::Damaged,
    };
    info!(summary = %report.summary(), "scan finished");
    Ok(report)
}

/// Decodes every round of `handle` without modifying the image.
pub fn scan<S: BlockSource, C: Codec>(
    handle: &mut FecHandle<S, C>,
    progress: Option<&mut ProgressFn<'_>>,
) -> Result<RecoveryReport, FecError> {
    run(handle, false, progress)
}

/// Decodes every round of `handle` and writes corrected rows and parity back.
/// The handle must be read-write.
pub fn repair<S: BlockSource, C: Codec>(
    handle: &mut FecHandle<S, C>,
    progress: Option<&mut ProgressFn<'_>>,
) -> Result<RecoveryReport, FecError> {
    if handle.get_status()?.mode != Mode::ReadWrite {
        return Err(FecError::ContractViolation("repair needs a read-write handle".into()));
    }
    run(handle, true, progress)
}

/// Convenience: open `path` read-only and scan it.
pub fn scan_file<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<RecoveryReport, FecError> {
    let mut handle = FecHandle::open(path, options.mode(Mode::ReadOnly))?;
    let report = scan(&mut handle, None)?;
    handle.close()?;
    Ok(report)
}

/// Convenience: open `path` read-write and repair it in place.
pub fn repair_file<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<RecoveryReport, FecError> {
    let mut handle = FecHandle::open(path, options.mode(Mode::ReadWrite))?;
    let report = repair(&mut handle, None)?;
    handle.close()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_stream::encoder::{EncodeOptions, FecEncoder};
    use crate::BLOCK_SIZE;
    use std::io::Cursor;

    const BS: usize = BLOCK_SIZE as usize;

    fn image(blocks: usize, roots: u8) -> Vec<u8> {
        let mut data: Vec<u8> = (0..blocks * BS).map(|i| (i % 199) as u8).collect();
        let trailer = FecEncoder::new(EncodeOptions { roots }).unwrap().encode_bytes(&data).unwrap();
        data.extend_from_slice(&trailer);
        data
    }

    #[test]
    fn clean_image_is_intact() {
        let mut h = FecHandle::from_source(Cursor::new(image(600, 4)), OpenOptions::new().roots(4)).unwrap();
        let mut calls = 0u64;
        let mut cb = |done: u64, total: u64| {
            calls += 1;
            assert!(done <= total);
        };
        let report = scan(&mut h, Some(&mut cb)).unwrap();
        assert_eq!(report.quality, RecoveryQuality::Intact);
        assert_eq!(report.total_rounds, 3);
        assert_eq!(report.healthy_rounds, 3);
        assert!(report.round_log.is_empty());
        assert_eq!(calls, 3);
    }

    #[test]
    fn scan_reports_without_writing() {
        let mut bytes = image(100, 4);
        bytes[3 * BS + 7] ^= 0x5a;
        bytes[3 * BS + 8] ^= 0x5a;
        let mut h = FecHandle::from_source(Cursor::new(bytes), OpenOptions::new().roots(4)).unwrap();
        let report = scan(&mut h, None).unwrap();
        assert_eq!(report.quality, RecoveryQuality::Correctable);
        assert_eq!(report.corrected_blocks, 1);
        assert_eq!(report.corrected_symbols, 2);
        assert_eq!(report.round_log[0].health, RoundHealth::Corrected { blocks: 1, symbols: 2 });
        assert!(!report.repaired);
        assert!(matches!(repair(&mut h, None), Err(FecError::ContractViolation(_))));
    }

    #[test]
    fn repair_restores_data_and_parity() {
        let clean = image(300, 2);
        let mut bytes = clean.clone();
        bytes[10 * BS] ^= 0x01;
        // Parity of round 1, codeword 5.
        let parity_start = 300 * BS;
        bytes[parity_start + 2 * BS + 5 * 2] ^= 0x80;

        let mut source = Cursor::new(bytes);
        {
            let opts = OpenOptions::new().mode(Mode::ReadWrite);
            let mut h = FecHandle::from_source(&mut source, opts).unwrap();
            let report = repair(&mut h, None).unwrap();
            assert_eq!(report.corrected_rounds, 2);
            assert!(report.repaired);
            h.close().unwrap();
        }
        assert!(source.get_ref() == &clean);
    }

    #[test]
    fn hopeless_round_is_damaged() {
        let mut bytes = image(20, 4);
        bytes[..3 * BS].fill(0xff);
        let mut h = FecHandle::from_source(Cursor::new(bytes), OpenOptions::new().roots(4)).unwrap();
        let report = scan(&mut h, None).unwrap();
        assert_eq!(report.quality, RecoveryQuality::Damaged);
        assert_eq!(report.uncorrectable_rounds, 1);
        assert_eq!(report.round_log[0].blocks.len(), 20);
    }

    #[test]
    fn unprotected_image() {
        let mut h = FecHandle::from_source(Cursor::new(vec![0u8; 8 * BS]), OpenOptions::new()).unwrap();
        let report = scan(&mut h, None).unwrap();
        assert_eq!(report.quality, RecoveryQuality::Unprotected);
        assert!(report.to_json().unwrap().contains("\"unprotected\""));
    }
}
