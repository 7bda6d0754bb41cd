//! Rank-keyed dataset sharding for multi-process training.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Splits `0..len` into `num_replicas` equally sized shards.
///
/// The index list is padded by wrap-around to a multiple of `num_replicas`
/// so every rank runs the same number of steps; rank `r` takes every
/// `num_replicas`-th index starting at `r`. With `shuffle`, the list is first
/// permuted by an RNG seeded with `seed + epoch`, identical on every rank.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    pub fn new(num_replicas: usize, rank: usize, shuffle: bool, seed: u64) -> anyhow::Result<Self> {
        if num_replicas == 0 {
            anyhow::bail!("num_replicas must be at least 1");
        }
        if rank >= num_replicas {
            anyhow::bail!("rank {rank} out of range for {num_replicas} replicas");
        }
        Ok(Self {
            num_replicas,
            rank,
            shuffle,
            seed,
            epoch: 0,
        })
    }

    /// Single-process sampler: every index, in order.
    pub fn sequential() -> Self {
        Self {
            num_replicas: 1,
            rank: 0,
            shuffle: false,
            seed: 0,
            epoch: 0,
        }
    }

    /// Reseed the shuffle for a new epoch.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Number of indices this rank receives for a dataset of `len`.
    pub fn shard_len(&self, len: usize) -> usize {
        len.div_ceil(self.num_replicas)
    }

    /// Indices this rank visits this epoch.
    pub fn indices(&self, len: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }
        let mut all: Vec<usize> = (0..len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            all.shuffle(&mut rng);
        }
        let total = self.shard_len(len) * self.num_replicas;
        let mut i = 0;
        while all.len() < total {
            all.push(all[i]);
            i += 1;
        }
        all.into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
