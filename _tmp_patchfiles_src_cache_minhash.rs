//! MinHash / LSH fuzzy matching over character-trigram shingles.
//!
//! Signatures are `H` 64-bit hashes split into `B` bands of `R` rows each
//! (`B*R = H`); two signatures collide in the LSH index iff any band's rows
//! match exactly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A 64-bit MinHash signature over a shingle set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinHashSignature(pub Vec<u64>);

/// Configuration for the MinHash/LSH index. `num_hashes` MUST be divisible
/// by `bands` or construction fails with `ConfigError`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MinHashConfig {
    pub num_hashes: usize,
    pub bands: usize,
    pub shingle_size: usize,
}

impl Default for MinHashConfig {
    fn default() -> Self {
        Self {
            num_hashes: 64,
            bands: 16,
            shingle_size: 3,
        }
    }
}

impl MinHashConfig {
    pub fn rows(&self) -> usize {
        self.num_hashes / self.bands
    }

    pub fn validate(&self) -> Result<()> {
        if self.bands == 0 || self.num_hashes % self.bands != 0 {
            return Err(Error::config(format!(
                "numHashes ({}) must be a positive multiple of bands ({})",
                self.num_hashes, self.bands
            )));
        }
        Ok(())
    }
}

/// Per-signature coefficients for the `num_hashes` independent permutation
/// functions, derived deterministically from the config so every signature
/// computed against the same config is comparable.
#[derive(Debug, Clone)]
pub struct MinHasher {
    config: MinHashConfig,
    coeffs: Vec<(u64, u64)>,
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;
const MERSENNE_PRIME: u64 = (1u64 << 61) - 1;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic splitmix64 used only to derive the per-hash `(a, b)`
/// coefficients from the config, so two `MinHasher`s built from equal
/// configs always produce comparable signatures.
fn splitmix64(seed: &mut u64) -> u64 {
    *seed = seed.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *seed;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

impl MinHasher {
    pub fn new(config: MinHashConfig) -> Result<Self> {
        config.validate()?;
        let mut seed = 0x5eed_u64;
        let coeffs = (0..config.num_hashes)
            .map(|_| {
                let a = splitmix64(&mut seed) | 1;
                let b = splitmix64(&mut seed);
                (a, b)
            })
            .collect();
        Ok(Self { config, coeffs })
    }

    pub fn config(&self) -> MinHashConfig {
        self.config
    }

    /// Character-trigram (or configured width) shingle set of `text`.
    pub fn shingles(&self, text: &str) -> HashSet<u64> {
        let chars: Vec<char> = text.chars().collect();
        let k = self.config.shingle_size;
        if chars.len() < k {
            let mut set = HashSet::new();
            if !chars.is_empty() {
                let s: String = chars.iter().collect();
                set.insert(fnv1a(s.as_bytes()));
            }
            return set;
        }
        let mut set = HashSet::with_capacity(chars.len() - k + 1);
        for window in chars.windows(k) {
            let s: String = window.iter().collect();
            set.insert(fnv1a(s.as_bytes()));
        }
        set
    }

    /// Compute the `num_hashes`-wide MinHash signature over `text`'s shingles.
    pub fn signature(&self, text: &str) -> MinHashSignature {
        let shingles = self.shingles(text);
        self.signature_of(&shingles)
    }

    pub fn signature_of(&self, shingles: &HashSet<u64>) -> MinHashSignature {
        let mut mins = vec![u64::MAX; self.config.num_hashes];
        for &shingle in shingles {
            for (i, &(a, b)) in self.coeffs.iter().enumerate() {
                let h = a
                    .wrapping_mul(shingle)
                    .wrapping_add(b)
                    % MERSENNE_PRIME;
                if h < mins[i] {
                    mins[i] = h;
                }
            }
        }
        MinHashSignature(mins)
    }

    /// Band-row slices used as the LSH index key for each of `bands` bands.
    pub fn bands(&self, signature: &MinHashSignature) -> Vec<&[u64]> {
        signature.0.chunks(self.config.rows()).collect()
    }

    /// Estimated Jaccard similarity between two signatures (fraction of
    /// matching rows across the full signature, not just one band).
    pub fn estimate_similarity(a: &MinHashSignature, b: &MinHashSignature) -> f64 {
        if a.0.len() != b.0.len() || a.0.is_empty() {
            return 0.0;
        }
        let matches = a.0.iter().zip(b.0.iter()).filter(|(x, y)| x == y).count();
        matches as f64 / a.0.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_divisible_bands() {
        let cfg = MinHashConfig {
            num_hashes: 64,
            bands: 17,
            shingle_size: 3,
        };
        assert!(MinHasher::new(cfg).is_err());
    }

    #[test]
    fn identical_text_has_similarity_one() {
        let hasher = MinHasher::new(MinHashConfig::default()).unwrap();
        let sig = hasher.signature("What is the capital of France?");
        assert_eq!(MinHasher::estimate_similarity(&sig, &sig), 1.0);
    }

    #[test]
    fn similar_text_scores_higher_than_unrelated() {
        let hasher = MinHasher::new(MinHashConfig::default()).unwrap();
        let a = hasher.signature("What is the capital of France?");
        let b = hasher.signature("What is the capital city of France?");
        let c = hasher.signature("Recommend a recipe for banana bread.");
        let sim_ab = MinHasher::estimate_similarity(&a, &b);
        let sim_ac = MinHasher::estimate_similarity(&a, &c);
        assert!(sim_ab > sim_ac);
    }

    #[test]
    fn bands_partition_signature_into_equal_chunks() {
        let hasher = MinHasher::new(MinHashConfig::default()).unwrap();
        let sig = hasher.signature("hello world");
        let bands = hasher.bands(&sig);
        assert_eq!(bands.len(), hasher.config().bands);
        assert!(bands.iter().all(|b| b.len() == hasher.config().rows()));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Estimated similarity is always within [0, 1] for arbitrary text.
            #[test]
            fn similarity_is_bounded(a in ".{0,200}", b in ".{0,200}") {
                let hasher = MinHasher::new(MinHashConfig::default()).unwrap();
                let sig_a = hasher.signature(&a);
                let sig_b = hasher.signature(&b);
                let sim = MinHasher::estimate_similarity(&sig_a, &sig_b);
                prop_assert!((0.0..=1.0).contains(&sim));
            }

            /// Self-similarity is always exactly 1.0, regardless of input text.
            #[test]
            fn self_similarity_is_always_one(text in ".{0,200}") {
                let hasher = MinHasher::new(MinHashConfig::default()).unwrap();
                let sig = hasher.signature(&text);
                prop_assert_eq!(MinHasher::estimate_similarity(&sig, &sig), 1.0);
            }
        }
    }
}


