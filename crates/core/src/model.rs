//! Decoder-only transformer and the interface the trainer drives it through.
//!
//! Pre-norm blocks (RMSNorm → attention → residual → RMSNorm → FFN/MoE →
//! residual), weight tying between token embedding and output projection.

use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, rms_norm, Embedding, RmsNorm, VarBuilder, VarMap};

use pretrain_common::ModelConfig;

use crate::attention::{CausalSelfAttention, PosCis};
use crate::ffn::FfnLayer;

// ── Interface ───────────────────────────────────────────────────────────────

/// Forward result: next-token logits `(b, t, vocab)` in f32 and a scalar
/// auxiliary loss (zero for dense models and in eval mode).
pub struct LmOutput {
    pub logits: Tensor,
    pub aux_loss: Tensor,
}

/// What the training loop needs from a model.
///
/// The training/eval flag gates dropout and auxiliary losses. Checkpoint
/// writes happen with the flag cleared, never during forward/backward.
pub trait CausalLm {
    fn forward(&self, input_ids: &Tensor) -> Result<LmOutput>;
    fn set_training(&self, training: bool);
    fn is_training(&self) -> bool;
    fn config(&self) -> &ModelConfig;

    fn train(&self) {
        self.set_training(true);
    }

    fn eval(&self) {
        self.set_training(false);
    }
}

// ── Decoder Block ───────────────────────────────────────────────────────────

struct DecoderBlock {
    attention_norm: RmsNorm,
    attention: CausalSelfAttention,
    ffn_norm: RmsNorm,
    ffn: FfnLayer,
}

impl DecoderBlock {
    fn new(config: &ModelConfig, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention_norm: rms_norm(config.dim, config.norm_eps, vb.pp("attention_norm"))?,
            attention: CausalSelfAttention::new(config, compute_dtype, vb.pp("attention"))?,
            ffn_norm: rms_norm(config.dim, config.norm_eps, vb.pp("ffn_norm"))?,
            ffn: FfnLayer::new(config, compute_dtype, vb.pp("feed_forward"))?,
        })
    }

    fn forward(&self, x: &Tensor, pos_cis: &PosCis, train: bool) -> Result<(Tensor, Option<Tensor>)> {
        let h = (x + self
            .attention
            .forward(&self.attention_norm.forward(x)?, pos_cis, train)?)?;
        let (ff, aux) = self.ffn.forward(&self.ffn_norm.forward(&h)?, train)?;
        Ok(((h + ff)?, aux))
    }
}

// ── TinyLm ──────────────────────────────────────────────────────────────────

/// Reference causal LM: dense SwiGLU or mixture-of-experts FFN.
pub struct TinyLm {
    tok_embeddings: Embedding,
    blocks: Vec<DecoderBlock>,
    norm: RmsNorm,
    pos_cis: PosCis,
    dropout: f32,
    training: AtomicBool,
    config: ModelConfig,
}

impl TinyLm {
    /// Build with parameters registered in `vb`. Matmuls run in `compute_dtype`.
    pub fn new(config: &ModelConfig, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        let tok_embeddings = embedding(config.vocab_size, config.dim, vb.pp("tok_embeddings"))?;
        let blocks = (0..config.n_layers)
            .map(|i| DecoderBlock::new(config, compute_dtype, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = rms_norm(config.dim, config.norm_eps, vb.pp("norm"))?;
        let pos_cis = PosCis::new(
            config.head_dim(),
            config.max_seq_len,
            config.rope_theta,
            vb.device(),
        )?;
        tracing::debug!(
            dim = config.dim,
            n_layers = config.n_layers,
            use_moe = config.use_moe,
            ?compute_dtype,
            "built TinyLm"
        );
        Ok(Self {
            tok_embeddings,
            blocks,
            norm,
            pos_cis,
            dropout: config.dropout,
            training: AtomicBool::new(true),
            config: config.clone(),
        })
    }

    /// Fresh f32 parameters in `varmap` on `device`.
    pub fn init(
        config: &ModelConfig,
        varmap: &VarMap,
        device: &Device,
        compute_dtype: DType,
    ) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::new(config, compute_dtype, vb)
    }
}

impl CausalLm for TinyLm {
    fn forward(&self, input_ids: &Tensor) -> Result<LmOutput> {
        let train = self.is_training();
        let (b, t) = input_ids.dims2()?;
        if t > self.pos_cis.max_seq_len() {
            candle_core::bail!(
                "sequence length {t} exceeds max_seq_len {}",
                self.pos_cis.max_seq_len()
            );
        }

        let mut h = self.tok_embeddings.forward(input_ids)?;
        if train && self.dropout > 0.0 {
            h = candle_nn::ops::dropout(&h, self.dropout)?;
        }
        let mut aux_loss = Tensor::zeros((), DType::F32, input_ids.device())?;
        for block in &self.blocks {
            let (next, aux) = block.forward(&h, &self.pos_cis, train)?;
            h = next;
            if let Some(aux) = aux {
                aux_loss = (aux_loss + aux)?;
            }
        }
        let h = self.norm.forward(&h)?;

        // Weight-tied output projection: logits = h @ E^T
        let d = self.config.dim;
        let logits = h
            .reshape((b * t, d))?
            .matmul(&self.tok_embeddings.embeddings().t()?)?
            .reshape((b, t, self.config.vocab_size))?;
        Ok(LmOutput { logits, aux_loss })
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::SeqCst);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::SeqCst)
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }
}

/// Trainable parameter count.
pub fn parameter_count(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(use_moe: bool) -> ModelConfig {
        ModelConfig {
            dim: 16,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            vocab_size: 32,
            max_seq_len: 8,
            use_moe,
            ..Default::default()
        }
    }

    #[test]
    fn forward_shapes() {
        let varmap = VarMap::new();
        let model = TinyLm::init(&tiny(false), &varmap, &Device::Cpu, DType::F32).unwrap();
        let ids = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 0]], &Device::Cpu).unwrap();
        let out = model.forward(&ids).unwrap();
        assert_eq!(out.logits.dims(), &[2, 4, 32]);
        assert_eq!(out.logits.dtype(), DType::F32);
        assert_eq!(out.aux_loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn moe_reports_aux_loss_in_training_only() {
        let varmap = VarMap::new();
        let model = TinyLm::init(&tiny(true), &varmap, &Device::Cpu, DType::F32).unwrap();
        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();

        assert!(model.is_training());
        let aux = model.forward(&ids).unwrap().aux_loss.to_scalar::<f32>().unwrap();
        assert!(aux > 0.0);

        model.eval();
        let aux = model.forward(&ids).unwrap().aux_loss.to_scalar::<f32>().unwrap();
        assert_eq!(aux, 0.0);
        model.train();
        assert!(model.is_training());
    }

    #[test]
    fn rejects_overlong_sequence() {
        let varmap = VarMap::new();
        let model = TinyLm::init(&tiny(false), &varmap, &Device::Cpu, DType::F32).unwrap();
        let ids = Tensor::zeros((1, 9), DType::U32, &Device::Cpu).unwrap();
        assert!(model.forward(&ids).is_err());
    }

    #[test]
    fn parameter_count_excludes_rotary_buffer() {
        let config = tiny(false);
        let varmap = VarMap::new();
        let _model = TinyLm::init(&config, &varmap, &Device::Cpu, DType::F32).unwrap();
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().all(|n| !n.contains(crate::POS_CIS)));

        let d = config.dim;
        let h = config.ffn_hidden_dim();
        let kv = config.n_kv_heads * config.head_dim();
        let per_block = d * d * 2 + d * kv * 2 + 3 * d * h + 2 * d;
        let expected = config.vocab_size * d + config.n_layers * per_block + d;
        assert_eq!(parameter_count(&varmap), expected);
    }
}
