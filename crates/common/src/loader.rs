//! Batching: sampler indices → collated [`Batch`]es, optionally prefetched
//! on a producer thread so the training loop is not starved.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::data::{Sample, SampleSource};
use crate::sampler::DistributedSampler;

/// Collated micro-batch, row-major `(batch_size, seq_len)`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub targets: Vec<u32>,
    pub loss_mask: Vec<f32>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    pub fn collate(samples: &[Sample]) -> Result<Self> {
        let Some(first) = samples.first() else {
            anyhow::bail!("cannot collate an empty batch");
        };
        let seq_len = first.len();
        let batch_size = samples.len();
        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut targets = Vec::with_capacity(batch_size * seq_len);
        let mut loss_mask = Vec::with_capacity(batch_size * seq_len);
        for s in samples {
            if s.len() != seq_len {
                anyhow::bail!("ragged batch: {} vs {} positions", s.len(), seq_len);
            }
            input_ids.extend_from_slice(&s.input_ids);
            targets.extend_from_slice(&s.targets);
            loss_mask.extend_from_slice(&s.loss_mask);
        }
        Ok(Self {
            input_ids,
            targets,
            loss_mask,
            batch_size,
            seq_len,
        })
    }

    /// `(input_ids u32, targets u32, loss_mask f32)`, each `(batch_size, seq_len)`.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let shape = (self.batch_size, self.seq_len);
        let x = Tensor::from_vec(self.input_ids.clone(), shape, device)?;
        let y = Tensor::from_vec(self.targets.clone(), shape, device)?;
        let mask = Tensor::from_vec(self.loss_mask.clone(), shape, device)?;
        Ok((x, y, mask))
    }

    /// Number of unmasked target positions.
    pub fn num_tokens(&self) -> usize {
        self.loss_mask.iter().filter(|&&m| m > 0.0).count()
    }
}

/// One epoch of batches over a sampler's shard. The final batch may be short.
pub struct BatchLoader {
    source: Arc<dyn SampleSource>,
    sampler: DistributedSampler,
    batch_size: usize,
    prefetch: usize,
}

impl BatchLoader {
    /// `prefetch = 0` collates inline; otherwise a producer thread keeps up to
    /// `prefetch` batches ready.
    pub fn new(
        source: Arc<dyn SampleSource>,
        sampler: DistributedSampler,
        batch_size: usize,
        prefetch: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        Ok(Self {
            source,
            sampler,
            batch_size,
            prefetch,
        })
    }

    /// Batches per epoch on this rank.
    pub fn len(&self) -> usize {
        self.sampler
            .shard_len(self.source.len())
            .div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.sampler.set_epoch(epoch);
    }

    pub fn epoch(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let chunks: Vec<Vec<usize>> = self
            .sampler
            .indices(self.source.len())
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();

        if self.prefetch == 0 {
            let source = &self.source;
            return Box::new(chunks.into_iter().map(move |idx| load_batch(source.as_ref(), &idx)));
        }

        let (tx, rx) = mpsc::sync_channel::<Result<Batch>>(self.prefetch);
        let source = Arc::clone(&self.source);
        thread::spawn(move || {
            for idx in chunks {
                let batch = load_batch(source.as_ref(), &idx);
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    return;
                }
            }
        });
        Box::new(rx.into_iter())
    }
}

fn load_batch(source: &dyn SampleSource, indices: &[usize]) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&i| source.sample(i))
        .collect::<Result<Vec<_>>>()?;
    Batch::collate(&samples)
}

// ── Tests ───────────────────────────────────────────────────────────────────
