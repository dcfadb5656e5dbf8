//! Whole-image verification and repair.
//!
//! [`scan`] decodes every round of an image's FEC parity and reports what it
//! found; [`repair`] does the same and writes every correction back.  Neither
//! needs the image to be readable through the normal block path: a round is
//! only ever judged by its own codewords (and, when a verified hash tree is
//! available, by the leaf hashes of its rows).

pub mod scanner;

use serde::Serialize;

pub use scanner::{repair, repair_file, scan, scan_file, ProgressFn};

/// The verdict for one round of codewords.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RoundHealth {
    /// Every codeword decoded with no changes.
    Healthy,
    /// Symbols were corrected; `blocks` rows changed.
    Corrected { blocks: usize, symbols: usize },
    /// At least one codeword is beyond the parity's capacity.
    Uncorrectable,
}

impl RoundHealth {
    pub fn is_usable(&self) -> bool {
        !matches!(self, RoundHealth::Uncorrectable)
    }
}

/// Diagnostic record for one round that was not healthy.
#[derive(Debug, Clone, Serialize)]
pub struct ScannedRound {
    pub round:  u64,
    /// Input blocks holding the rows of this round, in row order.
    pub blocks: Vec<u64>,
    pub health: RoundHealth,
}

/// Overall outcome of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryQuality {
    /// No corruption anywhere.
    Intact,
    /// Corruption found, all of it correctable.
    Correctable,
    /// Some rounds cannot be recovered.
    Damaged,
    /// The image carries no usable FEC trailer.
    Unprotected,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub total_rounds:         u64,
    pub healthy_rounds:       u64,
    pub corrected_rounds:     u64,
    pub uncorrectable_rounds: u64,
    /// Rows changed over all corrected rounds.
    pub corrected_blocks:     u64,
    pub corrected_symbols:    u64,
    /// Corrections were written back to the image.
    pub repaired:             bool,
    /// Non-healthy rounds only.
    pub round_log:            Vec<ScannedRound>,
    pub quality:              RecoveryQuality,
}

impl RecoveryReport {
    pub(crate) fn unprotected() -> Self {
        Self {
            total_rounds:         0,
            healthy_rounds:       0,
            corrected_rounds:     0,
            uncorrectable_rounds: 0,
            corrected_blocks:     0,
            corrected_symbols:    0,
            repaired:             false,
            round_log:            Vec::new(),
            quality:              RecoveryQuality::Unprotected,
        }
    }

    /// Percentage of rounds that are healthy (0.0–100.0).
    pub fn health_pct(&self) -> f64 {
        if self.total_rounds == 0 {
            return 100.0;
        }
        self.healthy_rounds as f64 / self.total_rounds as f64 * 100.0
    }

    pub fn summary(&self) -> String {
        format!(
            "{:?}: {}/{} rounds healthy ({:.1}%), {} corrected ({} blocks, {} symbols), {} uncorrectable{}",
            self.quality,
            self.healthy_rounds,
            self.total_rounds,
            self.health_pct(),
            self.corrected_rounds,
            self.corrected_blocks,
            self.corrected_symbols,
            self.uncorrectable_rounds,
            if self.repaired { ", repaired" } else { "" },
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
