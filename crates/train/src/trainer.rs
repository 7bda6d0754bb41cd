//! Trainer: the pre-training loop.
//!
//! Per micro-step: schedule the learning rate, forward, masked loss + aux
//! loss divided by `accumulation_steps`, scaled backward into the gradient
//! accumulator. Every `accumulation_steps` micro-steps the accumulated
//! gradients go through sync → unscale → clip → step → scaler update → zero.
//! Logging and checkpointing are gated to the reporting process.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use candle_core::{Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use pretrain_common::{Batch, BatchLoader, Precision};
use pretrain_core::CausalLm;

use crate::checkpoint::save_checkpoint;
use crate::distributed::{GradSync, LocalSync};
use crate::grads::{clip_grad_norm, GradAccumulator};
use crate::loss::masked_cross_entropy;
use crate::report::{Reporter, StepReport};
use crate::scaler::GradScaler;
use crate::scheduler::{LrDecay, LrScheduler};

// ── Config ──────────────────────────────────────────────────────────────────

/// Training hyper-parameters. Fixed for the whole run.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub lr_decay: LrDecay,
    pub warmup_iters: usize,
    pub weight_decay: f64,
    pub accumulation_steps: usize,
    pub grad_clip: f64,
    pub log_interval: usize,
    pub save_interval: usize,
    pub precision: Precision,
    pub save_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 32,
            learning_rate: 5e-4,
            lr_decay: LrDecay::Cosine,
            warmup_iters: 0,
            weight_decay: 0.01,
            accumulation_steps: 8,
            grad_clip: 1.0,
            log_interval: 100,
            save_interval: 100,
            precision: Precision::BF16,
            save_dir: PathBuf::from("out"),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            anyhow::bail!("epochs must be at least 1");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.accumulation_steps == 0 {
            anyhow::bail!("accumulation_steps must be at least 1");
        }
        if self.log_interval == 0 || self.save_interval == 0 {
            anyhow::bail!("log_interval and save_interval must be at least 1");
        }
        if self.grad_clip.is_nan() || self.grad_clip <= 0.0 {
            anyhow::bail!("grad_clip must be positive, got {}", self.grad_clip);
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            anyhow::bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        Ok(())
    }
}

/// What happened at an accumulation boundary.
#[derive(Debug, Clone, Copy)]
pub struct UpdateReport {
    /// Global gradient norm before clipping (after unscale and sync).
    pub grad_norm: f64,
    /// False when the scaler skipped the step on non-finite gradients.
    pub stepped: bool,
    pub scale: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct MicroStep {
    /// Loss before division by `accumulation_steps`.
    pub loss: f32,
    pub lr: f64,
    pub update: Option<UpdateReport>,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct Trainer<M: CausalLm> {
    model: M,
    varmap: VarMap,
    /// Sorted by name so every rank flattens gradients identically.
    named_vars: Vec<(String, Var)>,
    vars: Vec<Var>,
    optimizer: AdamW,
    scheduler: LrScheduler,
    scaler: GradScaler,
    accumulator: GradAccumulator,
    sync: Box<dyn GradSync>,
    reporter: Reporter,
    is_main: bool,
    config: TrainConfig,
    device: Device,
    optimizer_steps: usize,
    skipped_steps: usize,
}

impl<M: CausalLm> Trainer<M> {
    /// `varmap` must hold every trainable parameter of `model`.
    pub fn new(model: M, varmap: VarMap, config: TrainConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let mut named_vars: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("variable map lock poisoned: {e}"))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named_vars.sort_by(|a, b| a.0.cmp(&b.0));
        let vars: Vec<Var> = named_vars.iter().map(|(_, v)| v.clone()).collect();

        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        let scheduler = LrScheduler::new(config.learning_rate, config.warmup_iters, config.lr_decay);
        let scaler = GradScaler::new(config.precision.is_reduced());

        model.train();
        Ok(Self {
            model,
            varmap,
            named_vars,
            vars,
            optimizer,
            scheduler,
            scaler,
            accumulator: GradAccumulator::new(),
            sync: Box::new(LocalSync),
            reporter: Reporter::new(true),
            is_main: true,
            config,
            device,
            optimizer_steps: 0,
            skipped_steps: 0,
        })
    }

    /// Join a process group. Every rank leaves with rank 0's parameters.
    pub fn with_sync(mut self, sync: Box<dyn GradSync>) -> Result<Self> {
        sync.broadcast_params(&self.named_vars)?;
        self.sync = sync;
        Ok(self)
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Non-main processes never write checkpoints.
    pub fn main_process(mut self, is_main: bool) -> Self {
        self.is_main = is_main;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    /// Updates dropped by the loss scaler on overflow.
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    /// One micro-batch. `step` is the index within the epoch; the update
    /// fires when `(step + 1) % accumulation_steps == 0`.
    pub fn micro_step(&mut self, batch: &Batch, step: usize, lr: f64) -> Result<MicroStep> {
        self.optimizer.set_learning_rate(lr);

        if batch.num_tokens() == 0 {
            tracing::warn!(step, "batch has no target tokens, contributes zero gradient");
        }
        let (x, y, mask) = batch.to_tensors(&self.device)?;
        let out = self.model.forward(&x)?;
        let ce = masked_cross_entropy(&out.logits, &y, &mask)?;
        let loss = (ce + out.aux_loss)?;
        let loss_value = loss.to_scalar::<f32>()?;

        let divided = loss.affine(1.0 / self.config.accumulation_steps as f64, 0.0)?;
        let grads = self.scaler.scale_loss(&divided)?.backward()?;
        self.accumulator.accumulate(grads, &self.vars)?;

        let update = if (step + 1) % self.config.accumulation_steps == 0 {
            self.apply_update()?
        } else {
            None
        };
        Ok(MicroStep {
            loss: loss_value,
            lr,
            update,
        })
    }

    /// sync → unscale → clip → step → update → zero.
    fn apply_update(&mut self) -> Result<Option<UpdateReport>> {
        let Some(grads) = self.accumulator.store_mut() else {
            return Ok(None);
        };
        self.sync.all_reduce_mean(grads, &self.named_vars)?;
        self.scaler.unscale(grads, &self.vars)?;
        let grad_norm = clip_grad_norm(grads, &self.vars, self.config.grad_clip)?;
        let stepped = self.scaler.step(&mut self.optimizer, grads, &self.vars)?;
        let scale = self.scaler.scale();
        self.scaler.update()?;
        self.accumulator.zero();

        if stepped {
            self.optimizer_steps += 1;
        } else {
            self.skipped_steps += 1;
            tracing::warn!(grad_norm, scale, "non-finite gradients, update skipped");
        }
        Ok(Some(UpdateReport {
            grad_norm,
            stepped,
            scale,
        }))
    }

    /// One pass over `loader`. Gradients of an unfinished accumulation
    /// window carry over into the next epoch.
    pub fn train_epoch(&mut self, epoch: usize, loader: &BatchLoader) -> Result<()> {
        let iter_per_epoch = loader.len();
        let total_steps = self.config.epochs * iter_per_epoch;
        let start = Instant::now();

        for (step, batch) in loader.epoch().enumerate() {
            let batch = batch?;
            let lr = self
                .scheduler
                .lr_at(epoch * iter_per_epoch + step, total_steps);
            let micro = self.micro_step(&batch, step, lr)?;

            if step % self.config.log_interval == 0 {
                self.reporter.step(&StepReport {
                    epoch,
                    epochs: self.config.epochs,
                    step,
                    iter_per_epoch,
                    loss: micro.loss,
                    lr,
                    elapsed_secs: start.elapsed().as_secs_f64(),
                })?;
            }

            if (step + 1) % self.config.save_interval == 0 && self.is_main {
                save_checkpoint(&self.model, &self.varmap, &self.config.save_dir)?;
            }
        }
        Ok(())
    }

    /// Run every epoch, reseeding the sampler per epoch.
    pub fn fit(&mut self, loader: &mut BatchLoader) -> Result<()> {
        if loader.is_empty() {
            anyhow::bail!("no batches to train on");
        }
        self.reporter.info(&format!(
            "training: {} epochs × {} steps, accumulation {}, world size {}, precision {}",
            self.config.epochs,
            loader.len(),
            self.config.accumulation_steps,
            self.sync.world_size(),
            self.config.precision,
        ));
        for epoch in 0..self.config.epochs {
            loader.set_epoch(epoch as u64);
            self.train_epoch(epoch, loader)?;
        }
        if self.is_main {
            tracing::info!(
                optimizer_steps = self.optimizer_steps,
                skipped_steps = self.skipped_steps,
                "training done"
            );
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
