//! Model checkpoints: `{save_dir}/pretrain_{dim}[_moe].safetensors` plus the
//! model config as JSON beside it. Each save overwrites the previous one.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_nn::VarMap;

use pretrain_common::ModelConfig;
use pretrain_core::CausalLm;

pub fn checkpoint_path(save_dir: &Path, config: &ModelConfig) -> PathBuf {
    save_dir.join(format!("{}.safetensors", config.checkpoint_stem()))
}

pub fn config_path(save_dir: &Path, config: &ModelConfig) -> PathBuf {
    save_dir.join(format!("{}.json", config.checkpoint_stem()))
}

/// Write the weights with the model in eval mode, then restore training mode.
pub fn save_checkpoint<M: CausalLm + ?Sized>(
    model: &M,
    varmap: &VarMap,
    save_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(save_dir)
        .with_context(|| format!("creating {}", save_dir.display()))?;
    let config = model.config();
    let path = checkpoint_path(save_dir, config);

    let was_training = model.is_training();
    model.eval();
    let saved = varmap
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))
        .and_then(|_| config.save(&config_path(save_dir, config)));
    model.set_training(was_training);
    saved?;

    tracing::info!(path = %path.display(), "checkpoint saved");
    Ok(path)
}

/// Restore weights saved by [`save_checkpoint`] into an initialised `varmap`.
pub fn load_checkpoint(varmap: &mut VarMap, path: &Path) -> Result<()> {
    varmap
        .load(path)
        .with_context(|| format!("loading {}", path.display()))
}

// ── Tests ───────────────────────────────────────────────────────────────────
