//! Feed-forward sub-layers: SwiGLU and a routed mixture of SwiGLU experts.
//!
//! The mixture is computed densely (every expert sees every token, weighted
//! by a sparse routing matrix). That keeps the graph static and differentiable
//! through candle's autodiff at the cost of FLOPs.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use pretrain_common::ModelConfig;

use crate::linear::CastLinear;

/// SwiGLU FFN:
///
/// ```text
/// out = W2( SiLU(W1 x) ⊙ W3 x )
/// ```
pub struct FeedForward {
    w1: CastLinear,
    w2: CastLinear,
    w3: CastLinear,
    dropout: f32,
}

impl FeedForward {
    pub fn new(config: &ModelConfig, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        let hidden = config.ffn_hidden_dim();
        Ok(Self {
            w1: CastLinear::new(config.dim, hidden, compute_dtype, vb.pp("w1"))?,
            w2: CastLinear::new(hidden, config.dim, compute_dtype, vb.pp("w2"))?,
            w3: CastLinear::new(config.dim, hidden, compute_dtype, vb.pp("w3"))?,
            dropout: config.dropout,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w1.forward(x)?)?;
        let up = self.w3.forward(x)?;
        let y = self.w2.forward(&(gate * up)?)?;
        if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&y, self.dropout)
        } else {
            Ok(y)
        }
    }
}

/// Top-k routed experts plus optional always-on shared experts.
pub struct MoeFeedForward {
    gate: CastLinear,
    experts: Vec<FeedForward>,
    shared: Vec<FeedForward>,
    top_k: usize,
    norm_topk_prob: bool,
    aux_loss_alpha: f64,
}

impl MoeFeedForward {
    pub fn new(config: &ModelConfig, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        let n = config.n_routed_experts;
        // Routing stays in f32; small logit differences decide the top-k.
        let gate = CastLinear::new(config.dim, n, DType::F32, vb.pp("gate"))?;
        let experts = (0..n)
            .map(|i| FeedForward::new(config, compute_dtype, vb.pp(format!("experts.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let shared = (0..config.n_shared_experts)
            .map(|i| FeedForward::new(config, compute_dtype, vb.pp(format!("shared_experts.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            gate,
            experts,
            shared,
            top_k: config.num_experts_per_tok,
            norm_topk_prob: config.norm_topk_prob,
            aux_loss_alpha: config.aux_loss_alpha,
        })
    }

    /// Returns `(output, aux_loss)`; the auxiliary loss is zero outside training.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (b, t, d) = x.dims3()?;
        let device = x.device();
        let n_experts = self.experts.len();
        let flat = x.reshape((b * t, d))?;

        let scores = candle_nn::ops::softmax_last_dim(&self.gate.forward(&flat)?)?;
        let top_idx = scores
            .arg_sort_last_dim(false)?
            .narrow(D::Minus1, 0, self.top_k)?
            .contiguous()?;
        let mut top_w = scores.gather(&top_idx, D::Minus1)?;
        if self.norm_topk_prob && self.top_k > 1 {
            let denom = (top_w.sum_keepdim(D::Minus1)? + 1e-20)?;
            top_w = top_w.broadcast_div(&denom)?;
        }

        // Sparse routing as dense (tokens, experts) weights and hit counts.
        let expert_ids = Tensor::arange(0u32, n_experts as u32, device)?.reshape((1, n_experts))?;
        let mut routing = Tensor::zeros((b * t, n_experts), DType::F32, device)?;
        let mut hits = Tensor::zeros((b * t, n_experts), DType::F32, device)?;
        for j in 0..self.top_k {
            let one_hot = top_idx
                .narrow(D::Minus1, j, 1)?
                .broadcast_eq(&expert_ids)?
                .to_dtype(DType::F32)?;
            routing = (routing + one_hot.broadcast_mul(&top_w.narrow(D::Minus1, j, 1)?)?)?;
            hits = (hits + one_hot)?;
        }

        let mut out = flat.zeros_like()?;
        for (i, expert) in self.experts.iter().enumerate() {
            let w = routing.narrow(D::Minus1, i, 1)?;
            out = (out + expert.forward(&flat, train)?.broadcast_mul(&w)?)?;
        }
        for expert in &self.shared {
            out = (out + expert.forward(&flat, train)?)?;
        }

        let aux = if train && self.aux_loss_alpha > 0.0 {
            // f_i: share of top-k selections landing on expert i, scaled by n_experts.
            let fi = (hits.mean(0)? * (n_experts as f64 / self.top_k as f64))?;
            let pi = scores.mean(0)?;
            ((pi * fi)?.sum_all()? * self.aux_loss_alpha)?
        } else {
            Tensor::zeros((), DType::F32, device)?
        };

        Ok((out.reshape((b, t, d))?, aux))
    }
}

/// FFN variant selected by `use_moe`.
pub enum FfnLayer {
    Dense(FeedForward),
    Moe(MoeFeedForward),
}

impl FfnLayer {
    pub fn new(config: &ModelConfig, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        if config.use_moe {
            Ok(Self::Moe(MoeFeedForward::new(config, compute_dtype, vb)?))
        } else {
            Ok(Self::Dense(FeedForward::new(config, compute_dtype, vb)?))
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<(Tensor, Option<Tensor>)> {
        match self {
            Self::Dense(f) => Ok((f.forward(x, train)?, None)),
            Self::Moe(m) => {
                let (y, aux) = m.forward(x, train)?;
                Ok((y, Some(aux)))
            }
        }
    }
}
