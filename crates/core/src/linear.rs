//! Bias-free linear projection with autocast.
//!
//! Weights are stored in f32 (the optimiser's master copy). When the model
//! runs in reduced precision, input and weight are cast to the compute dtype
//! for the matmul and the result is cast back, so norms, residuals and the
//! loss stay in f32.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

pub struct CastLinear {
    inner: Linear,
    compute_dtype: DType,
}

impl CastLinear {
    pub fn new(in_dim: usize, out_dim: usize, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            inner: linear_no_bias(in_dim, out_dim, vb)?,
            compute_dtype,
        })
    }

    pub fn weight(&self) -> &Tensor {
        self.inner.weight()
    }
}

impl Module for CastLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.compute_dtype == x.dtype() {
            return self.inner.forward(x);
        }
        let w = self.inner.weight().to_dtype(self.compute_dtype)?;
        let y = x.to_dtype(self.compute_dtype)?.broadcast_matmul(&w.t()?)?;
        y.to_dtype(x.dtype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn f32_forward_matches_plain_linear() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = CastLinear::new(4, 3, DType::F32, vb).unwrap();
        let x = Tensor::ones((2, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 5, 3]);
        assert_eq!(y.dtype(), DType::F32);
    }
}
