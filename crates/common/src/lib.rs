//! # pretrain-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`TextEncoder`]** / **[`HfTokenizer`]** — text → token ids.
//! * **[`PretrainDataset`]** / **[`MmapDataset`]** — padded `(X, Y, loss_mask)` samples.
//! * **[`DistributedSampler`]** — rank-keyed dataset sharding.
//! * **[`BatchLoader`]** — collation and background prefetch.
//! * **[`Precision`]** — `--dtype` parsing and autocast rules.

pub mod config;
pub mod data;
pub mod loader;
pub mod precision;
pub mod sampler;

pub use config::ModelConfig;
pub use data::{
    write_pretokenized, HfTokenizer, MmapDataset, PretrainDataset, Sample, SampleSource,
    TextEncoder,
};
pub use loader::{Batch, BatchLoader};
pub use precision::Precision;
pub use sampler::DistributedSampler;
