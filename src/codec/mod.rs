//! Reed-Solomon codec over GF(2^8).
//!
//! # Parameters
//! Every codeword is a full-length `RS(255, 255 - roots)` code with generator
//! polynomial `0x11d`, first consecutive root `0` and primitive element
//! exponent `1`.  A codeword is laid out as `255 - roots` data symbols
//! followed by `roots` parity symbols.
//!
//! # Capacity
//! A codeword with `e` errors (unknown positions) and `f` erasures (known
//! positions) is recoverable when `2e + f <= roots`.  Anything beyond that is
//! reported as [`CodecError::Uncorrectable`]; decoded output is checked by
//! recomputing the syndromes before it is handed back.
//!
//! # Backends
//! Backends implement [`Codec`].  Image readers and encoders are generic over
//! the backend and default to [`ReedSolomon`], so selection happens at
//! compile time.

pub mod gf;

use thiserror::Error;

use gf::{alpha, log, modnn, A0, NN};

/// Largest supported number of parity symbols.
pub const MAX_ROOTS: u8 = 254;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid number of roots: {0} (must be 1..=254)")]
    InvalidRoots(u8),
    #[error("Codeword length {found} does not match RS(255, {data_len})")]
    BadLength { found: usize, data_len: usize },
    #[error("Too many erasures: {erasures} for {roots} roots")]
    TooManyErasures { erasures: usize, roots: u8 },
    #[error("Erasure position {0} is outside the codeword")]
    BadErasure(usize),
    /// More damage than the code can repair.  No output is produced.
    #[error("Codeword is uncorrectable")]
    Uncorrectable,
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    /// Parity symbols per codeword.
    fn roots(&self) -> u8;

    /// Data symbols per codeword.
    fn data_len(&self) -> usize {
        NN - usize::from(self.roots())
    }

    /// Computes the parity symbols of `data` (exactly [`Codec::data_len`]
    /// bytes) into `parity` (exactly [`Codec::roots`] bytes).
    fn encode(&self, data: &[u8], parity: &mut [u8]) -> Result<(), CodecError>;

    /// Corrects `codeword` (data followed by parity, 255 bytes) in place.
    ///
    /// `erasures` lists symbol positions known to be bad.  Returns the number
    /// of symbols that were corrected; `Ok(0)` means the codeword was clean
    /// and has not been touched.
    fn decode(&self, codeword: &mut [u8], erasures: &[usize]) -> Result<usize, CodecError>;
}

// ── Reed-Solomon backend ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReedSolomon {
    roots:   u8,
    /// Generator polynomial coefficients in index form, lowest degree first.
    genpoly: Vec<usize>,
}

impl ReedSolomon {
    pub fn new(roots: u8) -> Result<Self, CodecError> {
        if roots == 0 || roots > MAX_ROOTS {
            return Err(CodecError::InvalidRoots(roots));
        }
        let nroots = usize::from(roots);

        // g(x) = prod_{i=0}^{nroots-1} (x - alpha^i), built in polynomial form.
        let mut genpoly = vec![0u8; nroots + 1];
        genpoly[0] = 1;
        for i in 0..nroots {
            let root = i;
            genpoly[i + 1] = 1;
            for j in (1..=i).rev() {
                genpoly[j] = if genpoly[j] != 0 {
                    genpoly[j - 1] ^ alpha(modnn(log(genpoly[j]) + root))
                } else {
                    genpoly[j - 1]
                };
            }
            genpoly[0] = alpha(modnn(log(genpoly[0]) + root));
        }

        Ok(Self { roots, genpoly: genpoly.into_iter().map(log).collect() })
    }

    /// Syndromes of a full codeword in polynomial form.
    fn syndromes(&self, codeword: &[u8]) -> Vec<u8> {
        let nroots = usize::from(self.roots);
        let mut s = vec![codeword[0]; nroots];
        for &symbol in &codeword[1..] {
            for (i, si) in s.iter_mut().enumerate() {
                *si = if *si == 0 { symbol } else { symbol ^ alpha(modnn(log(*si) + i)) };
            }
        }
        s
    }
}

impl Codec for ReedSolomon {
    fn roots(&self) -> u8 {
        self.roots
    }

    fn encode(&self, data: &[u8], parity: &mut [u8]) -> Result<(), CodecError> {
        let nroots = usize::from(self.roots);
        if data.len() != self.data_len() || parity.len() != nroots {
            return Err(CodecError::BadLength { found: data.len() + parity.len(), data_len: self.data_len() });
        }
        parity.fill(0);

        for &symbol in data {
            let feedback = log(symbol ^ parity[0]);
            if feedback != A0 {
                for j in 1..nroots {
                    parity[j] ^= alpha(modnn(feedback + self.genpoly[nroots - j]));
                }
            }
            parity.copy_within(1.., 0);
            parity[nroots - 1] = if feedback != A0 {
                alpha(modnn(feedback + self.genpoly[0]))
            } else {
                0
            };
        }
        Ok(())
    }

    fn decode(&self, codeword: &mut [u8], erasures: &[usize]) -> Result<usize, CodecError> {
        let nroots = usize::from(self.roots);
        if codeword.len() != NN {
            return Err(CodecError::BadLength { found: codeword.len(), data_len: self.data_len() });
        }
        if erasures.len() > nroots {
            return Err(CodecError::TooManyErasures { erasures: erasures.len(), roots: self.roots });
        }
        if let Some(&bad) = erasures.iter().find(|&&p| p >= codeword.len()) {
            return Err(CodecError::BadErasure(bad));
        }

        let syn = self.syndromes(codeword);
        if syn.iter().all(|&s| s == 0) {
            return Ok(0);
        }
        let s: Vec<usize> = syn.into_iter().map(log).collect();

        // Erasure locator seeds the error locator.
        let mut lambda = vec![0u8; nroots + 1];
        lambda[0] = 1;
        if let Some(&first) = erasures.first() {
            lambda[1] = alpha(modnn(NN - 1 - first));
            for (i, &pos) in erasures.iter().enumerate().skip(1) {
                let u = modnn(NN - 1 - pos);
                for j in (1..=i + 1).rev() {
                    let tmp = log(lambda[j - 1]);
                    if tmp != A0 {
                        lambda[j] ^= alpha(modnn(u + tmp));
                    }
                }
            }
        }

        // Berlekamp-Massey.
        let no_eras = erasures.len();
        let mut b: Vec<usize> = lambda.iter().map(|&l| log(l)).collect();
        let mut t = vec![0u8; nroots + 1];
        let mut el = no_eras;
        for r in (no_eras + 1)..=nroots {
            let mut discr = 0u8;
            for i in 0..r {
                if lambda[i] != 0 && s[r - i - 1] != A0 {
                    discr ^= alpha(modnn(log(lambda[i]) + s[r - i - 1]));
                }
            }
            let discr_r = log(discr);
            if discr_r == A0 {
                b.copy_within(0..nroots, 1);
                b[0] = A0;
                continue;
            }

            t[0] = lambda[0];
            for i in 0..nroots {
                t[i + 1] = if b[i] != A0 {
                    lambda[i + 1] ^ alpha(modnn(discr_r + b[i]))
                } else {
                    lambda[i + 1]
                };
            }
            if 2 * el <= r + no_eras - 1 {
                el = r + no_eras - el;
                for i in 0..=nroots {
                    b[i] = if lambda[i] == 0 { A0 } else { modnn(log(lambda[i]) + NN - discr_r) };
                }
            } else {
                b.copy_within(0..nroots, 1);
                b[0] = A0;
            }
            lambda.copy_from_slice(&t);
        }

        let lambda: Vec<usize> = lambda.iter().map(|&l| log(l)).collect();
        let deg_lambda = lambda.iter().rposition(|&l| l != A0).unwrap_or(0);
        if deg_lambda == 0 {
            return Err(CodecError::Uncorrectable);
        }

        // Chien search for the roots of the error locator.
        let mut reg = lambda.clone();
        let mut roots = Vec::with_capacity(deg_lambda);
        let mut locs = Vec::with_capacity(deg_lambda);
        for i in 1..=NN {
            let mut q = 1u8;
            for j in (1..=deg_lambda).rev() {
                if reg[j] != A0 {
                    reg[j] = modnn(reg[j] + j);
                    q ^= alpha(reg[j]);
                }
            }
            if q != 0 {
                continue;
            }
            roots.push(i);
            locs.push(i - 1);
            if roots.len() == deg_lambda {
                break;
            }
        }
        if roots.len() != deg_lambda {
            return Err(CodecError::Uncorrectable);
        }
        let count = roots.len();
        let errors = count.saturating_sub(no_eras);
        if 2 * errors + no_eras > nroots {
            return Err(CodecError::Uncorrectable);
        }

        // Error evaluator omega(x) = s(x) * lambda(x) mod x^nroots, index form.
        let deg_omega = deg_lambda - 1;
        let omega: Vec<usize> = (0..=deg_omega)
            .map(|i| {
                let mut tmp = 0u8;
                for j in (0..=i).rev() {
                    if s[i - j] != A0 && lambda[j] != A0 {
                        tmp ^= alpha(modnn(s[i - j] + lambda[j]));
                    }
                }
                log(tmp)
            })
            .collect();

        // Forney: magnitude = omega(X^-1) / lambda'(X^-1), scaled by X^(1 - fcr).
        let mut corrected = codeword.to_vec();
        for j in (0..count).rev() {
            let root = roots[j];
            let mut num1 = 0u8;
            for (i, &o) in omega.iter().enumerate().rev() {
                if o != A0 {
                    num1 ^= alpha(modnn(o + i * root));
                }
            }
            let num2 = alpha(modnn(NN - root % NN));

            let mut den = 0u8;
            let top = deg_lambda.min(nroots - 1) & !1;
            for i in (0..=top).rev().step_by(2) {
                if lambda[i + 1] != A0 {
                    den ^= alpha(modnn(lambda[i + 1] + i * root));
                }
            }
            if den == 0 {
                return Err(CodecError::Uncorrectable);
            }
            if num1 != 0 {
                corrected[locs[j]] ^= alpha(modnn(log(num1) + log(num2) + NN - log(den)));
            }
        }

        if self.syndromes(&corrected).iter().any(|&s| s != 0) {
            return Err(CodecError::Uncorrectable);
        }
        let changed = corrected.iter().zip(codeword.iter()).filter(|(a, b)| a != b).count();
        codeword.copy_from_slice(&corrected);
        Ok(changed)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Builds the default backend for `roots` parity symbols.
pub fn get_codec(roots: u8) -> Result<ReedSolomon, CodecError> {
    ReedSolomon::new(roots)
}
