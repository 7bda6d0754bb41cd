//! Causal self-attention with grouped-query heads and rotary positions.
//!
//! The rotary tables are precomputed once per model ([`PosCis`]) and are not
//! trainable: they are identical on every process by construction, which is
//! why gradient synchronisation skips them by name ([`POS_CIS`]).

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use pretrain_common::ModelConfig;

use crate::linear::CastLinear;

/// Name of the precomputed rotary buffer.
pub const POS_CIS: &str = "pos_cis";

/// Rotary cos/sin tables, shape `(max_seq_len, head_dim / 2)`.
#[derive(Clone)]
pub struct PosCis {
    cos: Tensor,
    sin: Tensor,
}

impl PosCis {
    /// θ_i = theta^{-2i/d}, positions `0..max_seq_len`.
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        let d2 = head_dim / 2;
        let inv_freq: Vec<f32> = (0..d2)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, d2), device)?;
        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = positions.broadcast_mul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Tables for the first `t` positions.
    fn narrow(&self, t: usize) -> Result<(Tensor, Tensor)> {
        Ok((
            self.cos.narrow(0, 0, t)?.contiguous()?,
            self.sin.narrow(0, 0, t)?.contiguous()?,
        ))
    }

    pub fn max_seq_len(&self) -> usize {
        self.cos.dim(0).unwrap_or(0)
    }
}

/// Multi-head causal self-attention, `n_kv_heads` shared across query groups.
pub struct CausalSelfAttention {
    wq: CastLinear,
    wk: CastLinear,
    wv: CastLinear,
    wo: CastLinear,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    scale: f64,
    dropout: f32,
}

impl CausalSelfAttention {
    pub fn new(config: &ModelConfig, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        let dim = config.dim;
        let head_dim = config.head_dim();
        let kv_dim = config.n_kv_heads * head_dim;
        Ok(Self {
            wq: CastLinear::new(dim, config.n_heads * head_dim, compute_dtype, vb.pp("wq"))?,
            wk: CastLinear::new(dim, kv_dim, compute_dtype, vb.pp("wk"))?,
            wv: CastLinear::new(dim, kv_dim, compute_dtype, vb.pp("wv"))?,
            wo: CastLinear::new(config.n_heads * head_dim, dim, compute_dtype, vb.pp("wo"))?,
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
            dropout: config.dropout,
        })
    }

    pub fn forward(&self, x: &Tensor, pos_cis: &PosCis, train: bool) -> Result<Tensor> {
        let (b, t, _c) = x.dims3()?;
        let (cos, sin) = pos_cis.narrow(t)?;

        let q = self
            .wq
            .forward(x)?
            .reshape((b, t, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .wk
            .forward(x)?
            .reshape((b, t, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .wv
            .forward(x)?
            .reshape((b, t, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = apply_rotary(&q, &cos, &sin)?;
        let k = apply_rotary(&k, &cos, &sin)?;

        let n_rep = self.n_heads / self.n_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let mask = Tensor::tril2(t, DType::F32, x.device())?.reshape((1, 1, t, t))?;
        let ones = Tensor::ones((1, 1, t, t), DType::F32, x.device())?;
        let neg_inf = (-1e9f64 * (&ones - &mask)?)?;
        let scores = scores.broadcast_add(&neg_inf)?;
        let mut att = candle_nn::ops::softmax_last_dim(&scores)?;
        if train && self.dropout > 0.0 {
            att = candle_nn::ops::dropout(&att, self.dropout)?;
        }

        let y = att.matmul(&v)?; // (b, heads, t, head_dim)
        let y = y.transpose(1, 2)?.reshape((b, t, self.n_heads * self.head_dim))?;
        let mut y = self.wo.forward(&y)?;
        if train && self.dropout > 0.0 {
            y = candle_nn::ops::dropout(&y, self.dropout)?;
        }
        Ok(y)
    }
}

/// Rotate the two halves of the last dim: `(x1·cos − x2·sin, x1·sin + x2·cos)`.
fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let d = x.dim(D::Minus1)?;
    let x1 = x.narrow(D::Minus1, 0, d / 2)?;
    let x2 = x.narrow(D::Minus1, d / 2, d / 2)?;
    let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.unsqueeze(0)?.unsqueeze(0)?;
    let r1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
    let r2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
    Tensor::cat(&[&r1, &r2], D::Minus1)
}

/// `(b, n_kv, t, d)` → `(b, n_kv * n_rep, t, d)`, each kv head repeated for its query group.
fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(xs);
    }
    let (b, n_kv, t, d) = xs.dims4()?;
    Tensor::cat(&vec![&xs; n_rep], 2)?.reshape((b, n_kv * n_rep, t, d))
}
