//! Deterministic sampling primitives for the stability experiment.
//!
//! Every bootstrap cell owns its own generator, seeded from a SHA-256
//! domain-separated hash of (base seed, protocol, sample size, iteration).
//! Cells therefore produce the same draws whether they run sequentially or
//! on a worker pool, and any single cell can be re-run in isolation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SPLIT_SEED_DOMAIN: &[u8] = b"planeval.stability.split.v1";
const CELL_SEED_DOMAIN: &[u8] = b"planeval.stability.cell.v1";

/// xorshift64 generator. Not cryptographic; used only for reproducible
/// resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    pub fn seeded(seed: u64) -> Self {
        // xorshift has a single absorbing zero state; remap it.
        let state = if seed == 0 {
            0x9E37_79B9_7F4A_7C15
        } else {
            seed
        };
        Self { state }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform index in `[0, bound)`. `bound` must be positive.
    pub fn next_index(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        (self.next_u64() % bound as u64) as usize
    }
}

fn seed_from_digest(domain: &[u8], protocol: &str, suffix: &[u8], base_seed: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update((protocol.len() as u32).to_be_bytes());
    hasher.update(protocol.as_bytes());
    hasher.update(suffix);
    hasher.update(base_seed.to_be_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(out)
}

/// Seed of a protocol's train/test split permutation.
pub fn derive_split_seed(base_seed: u64, protocol: &str) -> u64 {
    seed_from_digest(SPLIT_SEED_DOMAIN, protocol, &[], base_seed)
}

/// Seed of one (protocol, N, iteration) bootstrap cell.
pub fn derive_cell_seed(base_seed: u64, protocol: &str, sample_size: usize, iteration: u32) -> u64 {
    let mut suffix = [0u8; 12];
    suffix[..8].copy_from_slice(&(sample_size as u64).to_be_bytes());
    suffix[8..].copy_from_slice(&iteration.to_be_bytes());
    seed_from_digest(CELL_SEED_DOMAIN, protocol, &suffix, base_seed)
}

/// `sample_size` draws with replacement from `[0, pool_size)`.
pub fn bootstrap_indices(
    rng: &mut DeterministicRng,
    pool_size: usize,
    sample_size: usize,
) -> Vec<usize> {
    (0..sample_size).map(|_| rng.next_index(pool_size)).collect()
}

/// Fisher-Yates permutation of `[0, len)`.
pub fn permutation(rng: &mut DeterministicRng, len: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    for i in (1..len).rev() {
        let j = rng.next_index(i + 1);
        indices.swap(i, j);
    }
    indices
}
