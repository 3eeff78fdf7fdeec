//! Finetuning variants
//!
//! Full finetuning trains and saves every parameter. LoRA finetuning trains the
//! model's adapter subset, optionally widened with the token embedding tables,
//! and saves only that subset.

use candle_core::Var;
use serde::{Deserialize, Serialize};

use crate::model::SpeechModel;
use crate::params::{FlatParams, ParamTree};

/// Name fragments identifying embedding tables
pub const EMBEDDING_PATTERNS: [&str; 2] = ["text_embeddings", "audio_embeddings"];

/// Which parameters are trained and persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinetuneMode {
    #[default]
    Full,
    Lora { train_embeddings: bool },
}

impl FinetuneMode {
    /// File name prefix for checkpoints written in this mode
    pub fn checkpoint_prefix(&self) -> &'static str {
        match self {
            FinetuneMode::Full => "ckpt",
            FinetuneMode::Lora { .. } => "lora_ckpt",
        }
    }

    /// Resolve the trainable parameter set of `model`
    pub fn select<M: SpeechModel + ?Sized>(&self, model: &M) -> ParamSelection {
        let trainable = match *self {
            FinetuneMode::Full => {
                let params = model.parameters().flatten();
                tracing::info!(
                    "Full finetuning: {} tensors, {} parameters",
                    params.len(),
                    count_elements(&params)
                );
                params
            }
            FinetuneMode::Lora { train_embeddings } => {
                let mut params = model.trainable_parameters().flatten();
                let adapter_tensors = params.len();
                tracing::info!(
                    "LoRA adapters: {} tensors, {} parameters",
                    adapter_tensors,
                    count_elements(&params)
                );

                if train_embeddings {
                    let embeddings: FlatParams = model
                        .parameters()
                        .flatten()
                        .into_iter()
                        .filter(|(name, _)| EMBEDDING_PATTERNS.iter().any(|p| name.contains(p)))
                        .collect();
                    tracing::info!(
                        "Embeddings: {} tensors, {} parameters",
                        embeddings.len(),
                        count_elements(&embeddings)
                    );
                    params.extend(embeddings);
                }

                tracing::info!(
                    "Total trainable: {} tensors, {} parameters",
                    params.len(),
                    count_elements(&params)
                );
                params
            }
        };

        ParamSelection {
            mode: *self,
            trainable,
        }
    }
}

fn count_elements(params: &FlatParams) -> usize {
    params.values().map(|v| v.elem_count()).sum()
}

/// Trainable parameters resolved for a model at trainer construction
#[derive(Debug, Clone)]
pub struct ParamSelection {
    mode: FinetuneMode,
    trainable: FlatParams,
}

impl ParamSelection {
    pub fn trainable(&self) -> &FlatParams {
        &self.trainable
    }

    pub fn is_empty(&self) -> bool {
        self.trainable.is_empty()
    }

    /// Variables handed to the optimizer
    pub fn vars(&self) -> Vec<Var> {
        self.trainable.values().cloned().collect()
    }

    /// Parameters written to a checkpoint
    pub fn params_to_save<M: SpeechModel + ?Sized>(&self, model: &M) -> ParamTree {
        match self.mode {
            FinetuneMode::Full => model.parameters(),
            FinetuneMode::Lora { .. } => ParamTree::from_flat(&self.trainable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::LoRAConfig;
    use crate::reference::{ReferenceConfig, ReferenceModel};
    use candle_core::Device;

    fn lora_model() -> ReferenceModel {
        ReferenceModel::new(
            ReferenceConfig::default().with_lora(LoRAConfig::default()),
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_prefixes() {
        assert_eq!(FinetuneMode::Full.checkpoint_prefix(), "ckpt");
        assert_eq!(
            FinetuneMode::Lora { train_embeddings: false }.checkpoint_prefix(),
            "lora_ckpt"
        );
    }

    #[test]
    fn test_lora_selection_without_embeddings() {
        let model = lora_model();
        let selection = FinetuneMode::Lora { train_embeddings: false }.select(&model);
        assert_eq!(selection.trainable().len(), 8);
        assert!(selection.trainable().keys().all(|k| k.contains("lora_")));
    }

    #[test]
    fn test_lora_selection_with_embeddings() {
        let model = lora_model();
        let selection = FinetuneMode::Lora { train_embeddings: true }.select(&model);
        let names: Vec<_> = selection.trainable().keys().cloned().collect();
        assert_eq!(names.len(), 10);
        assert!(names.contains(&"text_embeddings.weight".to_string()));
        assert!(names.contains(&"audio_embeddings.weight".to_string()));

        let saved = selection.params_to_save(&model).flatten();
        assert_eq!(saved.keys().collect::<Vec<_>>(), selection.trainable().keys().collect::<Vec<_>>());
    }

    #[test]
    fn test_full_selection_covers_everything() {
        let model = lora_model();
        let selection = FinetuneMode::Full.select(&model);
        assert_eq!(selection.trainable().len(), model.parameters().num_tensors());
        assert_eq!(selection.vars().len(), selection.trainable().len());
    }
}
