//! Dynamic loss scaling for reduced-precision training.
//!
//! Protocol per optimiser update, in this order:
//!
//! ```text
//! scale(loss).backward()  … × accumulation_steps
//! unscale(grads)          → detects inf/NaN
//! clip(grads)
//! step(optimizer, grads)  → skipped on overflow
//! update()                → backoff on overflow, growth after a clean streak
//! ```
//!
//! Out-of-order calls are errors. A disabled scaler (f32 training) is an
//! identity on the loss and never skips a step.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::Optimizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Accumulating scaled gradients.
    Ready,
    Unscaled,
    Stepped,
}

/// Scale-factor state owned by the mixed-precision side of the trainer.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
    found_inf: bool,
    stage: Stage,
}

impl GradScaler {
    /// Initial scale 2¹⁶, ×2 after 2000 clean updates, ×0.5 on overflow.
    pub fn new(enabled: bool) -> Self {
        Self::with_params(enabled, 65536.0, 2.0, 0.5, 2000)
    }

    pub fn with_params(
        enabled: bool,
        init_scale: f64,
        growth_factor: f64,
        backoff_factor: f64,
        growth_interval: usize,
    ) -> Self {
        Self {
            enabled,
            scale: init_scale,
            growth_factor,
            backoff_factor,
            growth_interval: growth_interval.max(1),
            growth_tracker: 0,
            found_inf: false,
            stage: Stage::Ready,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current multiplier (1.0 when disabled).
    pub fn scale(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Whether the last unscale saw a non-finite gradient.
    pub fn found_inf(&self) -> bool {
        self.found_inf
    }

    /// Multiply the loss by the current scale before `backward()`.
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        Ok(loss.affine(self.scale, 0.0)?)
    }

    /// Divide gradients by the scale in place and record overflow.
    pub fn unscale(&mut self, grads: &mut GradStore, vars: &[Var]) -> Result<()> {
        if self.stage != Stage::Ready {
            anyhow::bail!("unscale called twice in one update ({:?})", self.stage);
        }
        if self.enabled {
            let inv = 1.0 / self.scale;
            let mut found_inf = false;
            for var in vars {
                if let Some(g) = grads.remove(var.as_tensor()) {
                    let g = g.affine(inv, 0.0)?;
                    // x·0 is 0 for finite x and NaN otherwise; the sum cannot overflow.
                    let check = g
                        .affine(0.0, 0.0)?
                        .sum_all()?
                        .to_dtype(candle_core::DType::F32)?
                        .to_scalar::<f32>()?;
                    found_inf |= !check.is_finite();
                    grads.insert(var.as_tensor(), g);
                }
            }
            self.found_inf = found_inf;
        }
        self.stage = Stage::Unscaled;
        Ok(())
    }

    /// Apply the optimiser unless overflow was found. Unscales first if the
    /// caller has not. Returns whether the parameters were updated.
    pub fn step<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        grads: &mut GradStore,
        vars: &[Var],
    ) -> Result<bool> {
        match self.stage {
            Stage::Stepped => anyhow::bail!("step called twice without update"),
            Stage::Ready => self.unscale(grads, vars)?,
            Stage::Unscaled => {}
        }
        self.stage = Stage::Stepped;
        if self.enabled && self.found_inf {
            tracing::debug!(scale = self.scale, "skipping optimizer step: non-finite gradients");
            return Ok(false);
        }
        optimizer.step(grads)?;
        Ok(true)
    }

    /// Adjust the scale for the next update.
    pub fn update(&mut self) -> Result<()> {
        if self.stage != Stage::Stepped {
            anyhow::bail!("update called before step ({:?})", self.stage);
        }
        if self.enabled {
            if self.found_inf {
                self.scale *= self.backoff_factor;
                self.growth_tracker = 0;
            } else {
                self.growth_tracker += 1;
                if self.growth_tracker >= self.growth_interval {
                    self.scale *= self.growth_factor;
                    self.growth_tracker = 0;
                }
            }
        }
        self.found_inf = false;
        self.stage = Stage::Ready;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::SGD;

    fn setup(value: f32) -> (Var, GradStore) {
        let w = Var::from_tensor(&Tensor::new(&[1f32, 1.0], &Device::Cpu).unwrap()).unwrap();
        let c = Tensor::new(&[value, value], &Device::Cpu).unwrap();
        let grads = (w.as_tensor() * c).unwrap().sum_all().unwrap().backward().unwrap();
        (w, grads)
    }

    #[test]
    fn disabled_scaler_is_identity() {
        let scaler = GradScaler::new(false);
        let loss = Tensor::new(3f32, &Device::Cpu).unwrap();
        let scaled = scaler.scale_loss(&loss).unwrap();
        assert_eq!(scaled.to_scalar::<f32>().unwrap(), 3.0);
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn unscale_divides_by_scale() {
        let mut scaler = GradScaler::with_params(true, 8.0, 2.0, 0.5, 10);
        let (w, mut grads) = setup(16.0);
        scaler.unscale(&mut grads, &[w.clone()]).unwrap();
        let g: Vec<f32> = grads.get(w.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![2.0, 2.0]);
        assert!(!scaler.found_inf());
    }

    #[test]
    fn large_finite_grads_are_not_overflow() {
        let mut scaler = GradScaler::with_params(true, 1.0, 2.0, 0.5, 10);
        // Each element fits in f32; their sum does not.
        let (w, mut grads) = setup(3e38);
        scaler.unscale(&mut grads, &[w.clone()]).unwrap();
        assert!(!scaler.found_inf());
    }

    #[test]
    fn nan_grads_are_overflow() {
        let mut scaler = GradScaler::with_params(true, 1.0, 2.0, 0.5, 10);
        let (w, mut grads) = setup(f32::NAN);
        scaler.unscale(&mut grads, &[w.clone()]).unwrap();
        assert!(scaler.found_inf());
    }

    #[test]
    fn overflow_skips_step_and_backs_off() {
        let mut scaler = GradScaler::with_params(true, 1024.0, 2.0, 0.5, 10);
        let (w, mut grads) = setup(f32::INFINITY);
        let vars = vec![w.clone()];
        let mut opt = SGD::new(vars.clone(), 0.1).unwrap();

        scaler.unscale(&mut grads, &vars).unwrap();
        assert!(scaler.found_inf());
        assert!(!scaler.step(&mut opt, &mut grads, &vars).unwrap());
        scaler.update().unwrap();

        assert_eq!(scaler.scale(), 512.0);
        let after: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert_eq!(after, vec![1.0, 1.0]);
    }

    #[test]
    fn grows_after_clean_interval() {
        let mut scaler = GradScaler::with_params(true, 4.0, 2.0, 0.5, 2);
        for _ in 0..2 {
            let (w, mut grads) = setup(1.0);
            let vars = vec![w];
            let mut opt = SGD::new(vars.clone(), 0.0).unwrap();
            assert!(scaler.step(&mut opt, &mut grads, &vars).unwrap());
            scaler.update().unwrap();
        }
        assert_eq!(scaler.scale(), 8.0);
    }

    #[test]
    fn out_of_order_calls_fail() {
        let mut scaler = GradScaler::new(true);
        let (w, mut grads) = setup(1.0);
        let vars = vec![w.clone()];
        let mut opt = SGD::new(vars.clone(), 0.1).unwrap();

        assert!(scaler.update().is_err());
        scaler.unscale(&mut grads, &vars).unwrap();
        assert!(scaler.unscale(&mut grads, &vars).is_err());
        scaler.step(&mut opt, &mut grads, &vars).unwrap();
        assert!(scaler.step(&mut opt, &mut grads, &vars).is_err());
        scaler.update().unwrap();
    }
}
