use sha2::digest::Digest;

static ZEROES: [u8; 128] = [0u8; 128];

/// A digest primed with a salt, cloned for every block it hashes.
///
/// Every tree node is `H(salt || block)`; keeping the salted state around
/// saves re-feeding the salt for each block.
#[derive(Clone)]
pub struct SaltedHasher<D: Digest + Clone> {
    primed: D,
}

impl<D: Digest + Clone> SaltedHasher<D> {
    pub fn new(salt: &[u8]) -> Self {
        Self { primed: D::new_with_prefix(salt) }
    }

    /// Size in bytes of the digests produced by `D`.
    pub fn output_size() -> usize {
        <D as Digest>::output_size()
    }

    pub fn hash(&self, block: &[u8]) -> Vec<u8> {
        let mut d = self.primed.clone();
        d.update(block);
        d.finalize().to_vec()
    }

    /// Hashes `block` zero-padded to `padded_size` bytes.
    pub fn hash_padded(&self, block: &[u8], padded_size: usize) -> Vec<u8> {
        let mut d = self.primed.clone();
        d.update(block);
        update_zeroes(&mut d, padded_size.saturating_sub(block.len()));
        d.finalize().to_vec()
    }

    /// `H(salt || 0^block_size)`.
    pub fn zero_block(&self, block_size: usize) -> Vec<u8> {
        self.hash_padded(&[], block_size)
    }

    /// Checks `H(salt || block)` against `expected`.
    pub fn verify(&self, block: &[u8], expected: &[u8]) -> bool {
        self.hash(block) == expected
    }
}

fn update_zeroes<D: Digest>(d: &mut D, amount: usize) {
    let (quotient, remainder) = (amount / ZEROES.len(), amount % ZEROES.len());
    for _ in 0..quotient {
        d.update(ZEROES);
    }
    if remainder != 0 {
        d.update(&ZEROES[..remainder]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Sha256;

    #[test]
    fn salt_is_prepended() {
        let h = SaltedHasher::<Sha256>::new(b"salt");
        assert_eq!(h.hash(b"block"), Sha256::digest(b"saltblock").to_vec());
    }

    #[test]
    fn padding_matches_explicit_zeroes() {
        let h = SaltedHasher::<Sha256>::new(&[1u8; 32]);
        let mut block = vec![0u8; 4096];
        block[..3].copy_from_slice(b"abc");
        assert_eq!(h.hash_padded(b"abc", 4096), h.hash(&block));
        assert_eq!(h.zero_block(4096), h.hash(&[0u8; 4096]));
    }
}
