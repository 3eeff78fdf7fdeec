//! LoRA (Low-Rank Adaptation) layers for the reference model
//!
//! A [`LoRALinear`] wraps a frozen base projection and, when an adapter is
//! attached, adds the low-rank update `(x @ A) @ B * (alpha / rank)`. Only the
//! adapter matrices are reported as trainable.

use serde::{Deserialize, Serialize};

use crate::error::{FinetuneError, Result};

mod layer;

pub use layer::{LoRALayer, LoRALinear};

/// LoRA configuration shared by every adapted module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRAConfig {
    /// Low-rank dimension (r in the paper)
    pub rank: usize,

    /// Scaling factor (alpha in the paper, typically = rank)
    pub alpha: f32,

    /// Module names to apply LoRA to (e.g., ["backbone", "decoder"])
    pub target_modules: Vec<String>,
}

impl Default for LoRAConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16.0,
            target_modules: vec![
                "backbone".to_string(),
                "decoder".to_string(),
            ],
        }
    }
}

impl LoRAConfig {
    /// Whether `module` should receive an adapter
    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }

    /// Scaling applied to the low-rank update
    pub fn scaling(&self) -> f64 {
        self.alpha as f64 / self.rank as f64
    }
}

/// Validate LoRA configuration parameters
pub fn validate_lora_config(
    rank: usize,
    in_features: usize,
    out_features: usize,
) -> Result<()> {
    if in_features == 0 || out_features == 0 {
        return Err(FinetuneError::config("Feature dimensions must be positive"));
    }

    if rank == 0 || rank > in_features.min(out_features) {
        return Err(FinetuneError::config(format!(
            "Invalid rank {}: must be between 1 and min({}, {})",
            rank, in_features, out_features
        )));
    }

    Ok(())
}
