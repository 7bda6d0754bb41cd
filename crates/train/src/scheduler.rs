//! Learning-rate schedule: optional warmup → cosine decay to a `base/10` floor.

use std::str::FromStr;

/// Cosine variant after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    /// `floor + ½(base − floor)(1 + cos πp)`: starts at `base`, ends at `floor`.
    Cosine,
    /// `base/10 + ½·base(1 + cos πp)`: starts at `1.1·base`, ends at `base/10`.
    CosineOffset,
}

impl FromStr for LrDecay {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "floor" | "cosine" => Ok(Self::Cosine),
            "offset" => Ok(Self::CosineOffset),
            other => anyhow::bail!("unknown lr schedule {other:?} (expected floor or offset)"),
        }
    }
}

/// Stateless schedule: the rate is a pure function of `(step, total_steps)`.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    decay: LrDecay,
}

impl LrScheduler {
    /// Floor is fixed at `base_lr / 10`.
    pub fn new(base_lr: f64, warmup_steps: usize, decay: LrDecay) -> Self {
        Self {
            base_lr,
            min_lr: base_lr / 10.0,
            warmup_steps,
            decay,
        }
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn min_lr(&self) -> f64 {
        self.min_lr
    }

    /// Rate for global micro-step `step` of `total_steps`. Steps past the end clamp.
    pub fn lr_at(&self, step: usize, total_steps: usize) -> f64 {
        // Warmup: linear ramp from the floor up to base.
        if self.warmup_steps > 0 && step < self.warmup_steps {
            let frac = (step as f64 + 1.0) / self.warmup_steps as f64;
            return self.min_lr + (self.base_lr - self.min_lr) * frac;
        }
        if total_steps == 0 {
            return self.base_lr;
        }

        let step = step.min(total_steps);
        let decay_steps = total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = (step.saturating_sub(self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        let cos = (std::f64::consts::PI * progress).cos();

        match self.decay {
            LrDecay::Cosine => self.min_lr + 0.5 * (self.base_lr - self.min_lr) * (1.0 + cos),
            LrDecay::CosineOffset => self.min_lr + 0.5 * self.base_lr * (1.0 + cos),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_base_lr() {
        let sched = LrScheduler::new(5e-4, 0, LrDecay::Cosine);
        assert!((sched.lr_at(0, 1000) - 5e-4).abs() < 1e-15);
    }

    #[test]
    fn stays_within_floor_and_base() {
        let sched = LrScheduler::new(5e-4, 0, LrDecay::Cosine);
        let total = 977;
        let mut prev = f64::INFINITY;
        for step in 0..=total + 10 {
            let lr = sched.lr_at(step, total);
            assert!(lr >= 5e-5 - 1e-15 && lr <= 5e-4 + 1e-15, "lr {lr} at {step}");
            assert!(lr <= prev + 1e-18, "not monotone at {step}");
            prev = lr;
        }
        assert!((sched.lr_at(total, total) - 5e-5).abs() < 1e-15);
    }

    #[test]
    fn midpoint_is_halfway_between_floor_and_base() {
        let sched = LrScheduler::new(1e-3, 0, LrDecay::Cosine);
        // cos(π·0.5) = 0 → floor + ½(base − floor)
        assert!((sched.lr_at(500, 1000) - 5.5e-4).abs() < 1e-12);
    }

    #[test]
    fn offset_form_overshoots_at_start() {
        let sched = LrScheduler::new(1e-3, 0, LrDecay::CosineOffset);
        assert!((sched.lr_at(0, 100) - 1.1e-3).abs() < 1e-12);
        assert!((sched.lr_at(100, 100) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn warmup_ramps_linearly_from_floor() {
        let sched = LrScheduler::new(1e-3, 100, LrDecay::Cosine);
        // Step 0: 1e-4 + 9e-4 * (0+1)/100
        assert!((sched.lr_at(0, 1000) - 1.09e-4).abs() < 1e-12);
        assert!((sched.lr_at(49, 1000) - 5.5e-4).abs() < 1e-12);
        assert!((sched.lr_at(99, 1000) - 1e-3).abs() < 1e-12);
        assert!((sched.lr_at(100, 1000) - 1e-3).abs() < 1e-12);
        for step in 0..100 {
            assert!(sched.lr_at(step, 1000) >= sched.min_lr(), "below floor at {step}");
        }
    }

    #[test]
    fn parses_schedule_names() {
        assert_eq!("floor".parse::<LrDecay>().unwrap(), LrDecay::Cosine);
        assert_eq!("offset".parse::<LrDecay>().unwrap(), LrDecay::CosineOffset);
        assert!("linear".parse::<LrDecay>().is_err());
    }
}
