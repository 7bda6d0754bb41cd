//! # pretrain-train — Training Loop
//!
//! Everything between a batch and a parameter update:
//!
//! * **[`Trainer`]** — micro-step forward/backward, accumulation boundary
//!   (sync → unscale → clip → step → update → zero), rank-gated logging and
//!   checkpointing.
//! * **[`LrScheduler`]** — cosine decay to a `base/10` floor, optional warmup.
//! * **[`GradScaler`]** — dynamic loss scaling for f16/bf16 runs.
//! * **[`GradAccumulator`]**, [`clip_grad_norm`] — gradient bookkeeping.
//! * **[`DistEnv`]**, [`GradSync`] — data-parallel process group (TCP, or
//!   NCCL with the `nccl` feature).

pub mod checkpoint;
pub mod distributed;
pub mod grads;
pub mod loss;
#[cfg(feature = "nccl")]
pub mod nccl;
pub mod report;
pub mod scaler;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{checkpoint_path, load_checkpoint, save_checkpoint};
pub use distributed::{DistEnv, GradSync, LocalSync, TcpSync};
pub use grads::{clip_grad_norm, grad_norm, GradAccumulator};
pub use loss::masked_cross_entropy;
#[cfg(feature = "nccl")]
pub use nccl::NcclSync;
pub use report::{epoch_time_left_minutes, MetricsSink, Reporter, StepReport};
pub use scaler::GradScaler;
pub use scheduler::{LrDecay, LrScheduler};
pub use trainer::{MicroStep, TrainConfig, Trainer, UpdateReport};
