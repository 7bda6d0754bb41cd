//! Gradient accumulation across micro-batches and global-norm clipping.
//!
//! candle hands back a fresh [`GradStore`] per `backward()`; the accumulator
//! sums the parameter gradients of successive stores until the optimiser
//! consumes them and [`GradAccumulator::zero`] drops them.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};

/// Running sum of parameter gradients since the last optimiser update.
#[derive(Default)]
pub struct GradAccumulator {
    store: Option<GradStore>,
    micro_steps: usize,
}

impl GradAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the gradients of `vars` from one backward pass. Non-parameter
    /// entries of `grads` (activations) are dropped.
    pub fn accumulate(&mut self, grads: GradStore, vars: &[Var]) -> Result<()> {
        let mut acc = match self.store.take() {
            Some(acc) => acc,
            None => {
                let device = vars.first().map(|v| v.device().clone()).unwrap_or(Device::Cpu);
                empty_grad_store(&device)?
            }
        };
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let sum = match acc.remove(var.as_tensor()) {
                    Some(prev) => (prev + g)?,
                    None => g.clone(),
                };
                acc.insert(var.as_tensor(), sum);
            }
        }
        self.store = Some(acc);
        self.micro_steps += 1;
        Ok(())
    }

    /// Micro-steps folded in since the last [`zero`](Self::zero).
    pub fn micro_steps(&self) -> usize {
        self.micro_steps
    }

    pub fn store(&self) -> Option<&GradStore> {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> Option<&mut GradStore> {
        self.store.as_mut()
    }

    /// Release the accumulated gradients (set-to-none, not fill-with-zero).
    pub fn zero(&mut self) {
        self.store = None;
        self.micro_steps = 0;
    }
}

/// `GradStore` has no public constructor: backprop through an untracked
/// scalar yields a store holding only that scalar, which is then removed.
fn empty_grad_store(device: &Device) -> Result<GradStore> {
    let anchor = Tensor::zeros((), DType::F32, device)?;
    let mut store = anchor.backward()?;
    store.remove(&anchor);
    Ok(store)
}

// ── Norm & clipping ─────────────────────────────────────────────────────────

/// Total L2 norm of the gradients of `vars`. Non-finite if any gradient is.
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Clip gradients so their global L2 norm ≤ `max_norm`. Returns the norm
/// before clipping; a non-finite norm leaves the gradients untouched.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if !norm.is_finite() || norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / (norm + 1e-6);
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let clipped = g.affine(scale, 0.0)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    /// Gradients of `sum(w * c)` w.r.t. `w` are exactly `c`.
    fn grads_for(w: &Var, c: &[f32]) -> GradStore {
        let c = Tensor::new(c, &Device::Cpu).unwrap();
        (w.as_tensor() * c).unwrap().sum_all().unwrap().backward().unwrap()
    }

    fn grad_of(store: &GradStore, w: &Var) -> Vec<f32> {
        store.get(w.as_tensor()).unwrap().to_vec1().unwrap()
    }

    #[test]
    fn accumulates_sum_of_micro_batches() {
        let w = var(&[1.0, 2.0]);
        let vars = vec![w.clone()];
        let mut acc = GradAccumulator::new();
        acc.accumulate(grads_for(&w, &[1.0, 0.5]), &vars).unwrap();
        acc.accumulate(grads_for(&w, &[2.0, -1.5]), &vars).unwrap();
        assert_eq!(acc.micro_steps(), 2);
        assert_eq!(grad_of(acc.store().unwrap(), &w), vec![3.0, -1.0]);

        acc.zero();
        assert!(acc.store().is_none());
        assert_eq!(acc.micro_steps(), 0);
    }

    #[test]
    fn accumulator_drops_activation_grads() {
        let w = var(&[1.0]);
        let other = var(&[5.0]);
        let mut acc = GradAccumulator::new();
        acc.accumulate(grads_for(&w, &[1.0]), &[w.clone()]).unwrap();
        assert!(acc.store().unwrap().get(other.as_tensor()).is_none());
        assert!(acc.store().unwrap().get(w.as_tensor()).is_some());
    }

    #[test]
    fn clip_scales_down_to_max_norm() {
        let w = var(&[0.0, 0.0]);
        let vars = vec![w.clone()];
        let mut grads = grads_for(&w, &[3.0, 4.0]);
        let before = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((before - 5.0).abs() < 1e-6);
        let after = grad_norm(&grads, &vars).unwrap();
        assert!((after - 1.0).abs() < 1e-5);
    }

    #[test]
    fn clip_leaves_small_gradients_alone() {
        let w = var(&[0.0, 0.0]);
        let vars = vec![w.clone()];
        let mut grads = grads_for(&w, &[0.3, 0.4]);
        clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert_eq!(grad_of(&grads, &w), vec![0.3, 0.4]);
    }
}
