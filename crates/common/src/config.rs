//! Model configuration for the pre-training driver.
//!
//! Serialised as JSON next to every checkpoint. Every field has a default so
//! a minimal `{}` JSON produces a working (if small) model.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Configuration for the decoder-only transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    // ── Core dimensions ─────────────────────────────────────────────────────
    /// Model width (d_model).
    #[serde(default = "default_dim")]
    pub dim: usize,
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    /// Key/value heads for grouped-query attention. Must divide `n_heads`.
    #[serde(default = "default_n_kv_heads")]
    pub n_kv_heads: usize,
    /// Vocabulary size (must match the tokenizer).
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// FFN width. `None` derives it from `dim` and `multiple_of`.
    #[serde(default)]
    pub hidden_dim: Option<usize>,
    #[serde(default = "default_multiple_of")]
    pub multiple_of: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// Training context length; samples are padded/truncated to this.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub dropout: f32,

    // ── Mixture of experts ──────────────────────────────────────────────────
    #[serde(default)]
    pub use_moe: bool,
    #[serde(default = "default_experts_per_tok")]
    pub num_experts_per_tok: usize,
    #[serde(default = "default_routed_experts")]
    pub n_routed_experts: usize,
    /// Always-on experts added to the routed mixture (0 disables).
    #[serde(default = "default_shared_experts")]
    pub n_shared_experts: usize,
    /// Weight of the load-balancing auxiliary loss.
    #[serde(default = "default_aux_loss_alpha")]
    pub aux_loss_alpha: f64,
    /// Renormalise the top-k gate weights to sum to one.
    #[serde(default = "default_true")]
    pub norm_topk_prob: bool,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_dim() -> usize {
    512
}
fn default_n_layers() -> usize {
    8
}
fn default_n_heads() -> usize {
    8
}
fn default_n_kv_heads() -> usize {
    2
}
fn default_vocab_size() -> usize {
    6400
}
fn default_multiple_of() -> usize {
    64
}
fn default_norm_eps() -> f64 {
    1e-5
}
fn default_max_seq_len() -> usize {
    512
}
fn default_rope_theta() -> f64 {
    1e6
}
fn default_experts_per_tok() -> usize {
    2
}
fn default_routed_experts() -> usize {
    4
}
fn default_shared_experts() -> usize {
    1
}
fn default_aux_loss_alpha() -> f64 {
    0.1
}
fn default_true() -> bool {
    true
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim: default_dim(),
            n_layers: default_n_layers(),
            n_heads: default_n_heads(),
            n_kv_heads: default_n_kv_heads(),
            vocab_size: default_vocab_size(),
            hidden_dim: None,
            multiple_of: default_multiple_of(),
            norm_eps: default_norm_eps(),
            max_seq_len: default_max_seq_len(),
            rope_theta: default_rope_theta(),
            dropout: 0.0,
            use_moe: false,
            num_experts_per_tok: default_experts_per_tok(),
            n_routed_experts: default_routed_experts(),
            n_shared_experts: default_shared_experts(),
            aux_loss_alpha: default_aux_loss_alpha(),
            norm_topk_prob: true,
        }
    }
}

impl ModelConfig {
    /// Head dimension (`dim / n_heads`).
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// FFN width: explicit `hidden_dim`, else `8/3 · dim` rounded up to `multiple_of`.
    pub fn ffn_hidden_dim(&self) -> usize {
        if let Some(h) = self.hidden_dim {
            return h;
        }
        let raw = 4 * self.dim * 2 / 3;
        let m = self.multiple_of.max(1);
        m * raw.div_ceil(m)
    }

    /// File stem shared by checkpoint weights and config: `pretrain_{dim}[_moe]`.
    pub fn checkpoint_stem(&self) -> String {
        let moe = if self.use_moe { "_moe" } else { "" };
        format!("pretrain_{}{}", self.dim, moe)
    }

    /// Reject shapes the model cannot be built from.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            anyhow::bail!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim,
                self.n_heads
            );
        }
        if self.n_kv_heads == 0 || self.n_heads % self.n_kv_heads != 0 {
            anyhow::bail!(
                "n_heads ({}) must be divisible by n_kv_heads ({})",
                self.n_heads,
                self.n_kv_heads
            );
        }
        if self.head_dim() % 2 != 0 {
            anyhow::bail!("head_dim ({}) must be even for RoPE", self.head_dim());
        }
        if self.use_moe && self.num_experts_per_tok > self.n_routed_experts {
            anyhow::bail!(
                "num_experts_per_tok ({}) exceeds n_routed_experts ({})",
                self.num_experts_per_tok,
                self.n_routed_experts
            );
        }
        if self.max_seq_len < 2 {
            anyhow::bail!("max_seq_len must be at least 2");
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let loaded: ModelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded, ModelConfig::default());
        assert_eq!(loaded.dim, 512);
        assert!(!loaded.use_moe);
    }

    #[test]
    fn ffn_hidden_dim_rounds_to_multiple() {
        let config = ModelConfig::default();
        // 8/3 · 512 = 1365 → next multiple of 64 is 1408
        assert_eq!(config.ffn_hidden_dim(), 1408);

        let explicit = ModelConfig {
            hidden_dim: Some(100),
            ..Default::default()
        };
        assert_eq!(explicit.ffn_hidden_dim(), 100);
    }

    #[test]
    fn checkpoint_stem_encodes_width_and_moe() {
        let mut config = ModelConfig {
            dim: 768,
            ..Default::default()
        };
        assert_eq!(config.checkpoint_stem(), "pretrain_768");
        config.use_moe = true;
        assert_eq!(config.checkpoint_stem(), "pretrain_768_moe");
    }

    #[test]
    fn validate_rejects_bad_head_split() {
        let config = ModelConfig {
            dim: 100,
            n_heads: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ModelConfig {
            n_kv_heads: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn save_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = ModelConfig {
            use_moe: true,
            n_layers: 2,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(ModelConfig::load(&path).unwrap(), config);
    }
}
