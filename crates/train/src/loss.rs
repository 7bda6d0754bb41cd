//! Masked next-token cross-entropy.

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::ops;

/// Per-token cross-entropy weighted by `mask`, normalised by the number of
/// unmasked tokens (not by batch size), so padding never dilutes the loss.
/// A mask with no tokens yields a zero loss that still backpropagates
/// (all-zero gradients).
///
/// * `logits`: `(b, t, vocab)` float
/// * `targets`: `(b, t)` u32
/// * `mask`: `(b, t)` with 1.0 for real targets, 0.0 for padding
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let logits = logits.to_dtype(DType::F32)?.reshape((b * t, v))?;
    let log_probs = ops::log_softmax(&logits, D::Minus1)?;
    let targets = targets.to_dtype(DType::U32)?.reshape((b * t, 1))?;
    let nll = log_probs.gather(&targets, D::Minus1)?.squeeze(D::Minus1)?.neg()?;

    let mask = mask.to_dtype(DType::F32)?.reshape((b * t,))?;
    let valid = mask.sum_all()?.to_scalar::<f32>()?;
    Ok((nll * mask)?.sum_all()?.affine(1.0 / valid.max(1.0) as f64, 0.0)?)
}

// ── Tests ───────────────────────────────────────────────────────────────────
