//! GF(2^8) arithmetic over the primitive polynomial `x^8 + x^4 + x^3 + x^2 + 1`
//! (`0x11d`), in the log/antilog form used by the Reed-Solomon decoder.
//!
//! Elements are kept in one of two representations:
//! - *polynomial* form: the plain byte value;
//! - *index* form: the discrete log `i` such that `alpha^i == value`, with
//!   [`A0`] standing in for `log(0)`.

/// Field size minus one; also the full codeword length.
pub const NN: usize = 255;
/// Index form of zero.
pub const A0: usize = NN;

const POLY: u16 = 0x11d;

pub struct Tables {
    /// `alpha_to[i] = alpha^i`; `alpha_to[A0] = 0`.
    pub alpha_to: [u8; NN + 1],
    /// `index_of[v] = log(v)`; `index_of[0] = A0`.
    pub index_of: [usize; NN + 1],
}

const fn build_tables() -> Tables {
    let mut alpha_to = [0u8; NN + 1];
    let mut index_of = [0usize; NN + 1];
    index_of[0] = A0;
    alpha_to[A0] = 0;

    let mut sr: u16 = 1;
    let mut i = 0;
    while i < NN {
        index_of[sr as usize] = i;
        alpha_to[i] = sr as u8;
        sr <<= 1;
        if sr & 0x100 != 0 {
            sr ^= POLY;
        }
        i += 1;
    }
    Tables { alpha_to, index_of }
}

pub static TABLES: Tables = build_tables();

/// Reduces an exponent modulo `NN` without a division.
#[inline]
pub fn modnn(mut x: usize) -> usize {
    while x >= NN {
        x -= NN;
        x = (x >> 8) + (x & NN);
    }
    x
}

#[inline]
pub fn alpha(i: usize) -> u8 {
    TABLES.alpha_to[i]
}

#[inline]
pub fn log(v: u8) -> usize {
    TABLES.index_of[v as usize]
}

/// Polynomial-form multiply.
#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        0
    } else {
        alpha(modnn(log(a) + log(b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mul_slow(mut a: u8, mut b: u8) -> u8 {
        let mut acc = 0u8;
        while b != 0 {
            if b & 1 != 0 {
                acc ^= a;
            }
            let hi = a & 0x80;
            a <<= 1;
            if hi != 0 {
                a ^= (POLY & 0xff) as u8;
            }
            b >>= 1;
        }
        acc
    }

    #[test]
    fn tables_are_inverse() {
        for v in 1..=255u8 {
            assert_eq!(alpha(log(v)), v);
        }
        assert_eq!(log(0), A0);
        assert_eq!(alpha(A0), 0);
        // alpha is primitive: its powers hit every non-zero element once.
        let mut seen = [false; 256];
        for i in 0..NN {
            assert!(!seen[alpha(i) as usize]);
            seen[alpha(i) as usize] = true;
        }
    }

    #[test]
    fn table_multiply_matches_shift_and_add() {
        for a in (0..=255u8).step_by(7) {
            for b in 0..=255u8 {
                assert_eq!(mul(a, b), mul_slow(a, b), "a={a:#04x} b={b:#04x}");
            }
        }
    }

    #[test]
    fn modnn_reduces_large_exponents() {
        assert_eq!(modnn(0), 0);
        assert_eq!(modnn(NN), 0);
        assert_eq!(modnn(NN + 3), 3);
        assert_eq!(modnn(3 * NN + 17), 17);
    }
}
