//! Small reference model implementing [`SpeechModel`]
//!
//! This is not a speech model worth sampling from: the backbone and decoder are
//! residual MLP stacks rather than transformers. It has the same parameter
//! layout conventions as the real thing (`text_embeddings`, `audio_embeddings`,
//! per-codebook `audio_head`) so the trainer, checkpointing and adapter
//! selection can be exercised end to end.

use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FinetuneError, Result};
use crate::lora::{LoRAConfig, LoRALinear};
use crate::model::SpeechModel;
use crate::params::ParamTree;

/// Reference model dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub n_audio_codebooks: usize,
    pub audio_vocab_size: usize,
    pub text_vocab_size: usize,
    pub backbone_dim: usize,
    pub decoder_dim: usize,
    pub backbone_layers: usize,
    pub decoder_layers: usize,
    /// Attach adapters to the modules named in the config
    #[serde(default)]
    pub lora: Option<LoRAConfig>,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            n_audio_codebooks: 4,
            audio_vocab_size: 64,
            text_vocab_size: 128,
            backbone_dim: 32,
            decoder_dim: 16,
            backbone_layers: 2,
            decoder_layers: 2,
            lora: None,
        }
    }
}

impl ReferenceConfig {
    pub fn with_lora(mut self, lora: LoRAConfig) -> Self {
        self.lora = Some(lora);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_audio_codebooks == 0 {
            return Err(FinetuneError::config("n_audio_codebooks must be at least 1"));
        }
        if self.audio_vocab_size == 0 || self.text_vocab_size == 0 {
            return Err(FinetuneError::config("vocabulary sizes must be positive"));
        }
        if self.backbone_dim == 0 || self.decoder_dim == 0 {
            return Err(FinetuneError::config("model dimensions must be positive"));
        }
        Ok(())
    }
}

pub struct ReferenceModel {
    config: ReferenceConfig,
    device: Device,
    text_embeddings: Var,
    /// One table for all codebooks, codebook `i` starts at row `i * audio_vocab_size`
    audio_embeddings: Var,
    backbone: Vec<LoRALinear>,
    codebook0_head: LoRALinear,
    projection: LoRALinear,
    decoder: Vec<LoRALinear>,
    audio_head: Vec<Var>,
}

impl ReferenceModel {
    pub fn new(config: ReferenceConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let d = config.backbone_dim;
        let dd = config.decoder_dim;
        let vocab = config.audio_vocab_size;
        let n = config.n_audio_codebooks;

        let text_embeddings = Var::randn(0f32, 0.02, (config.text_vocab_size, d), device)?;
        let audio_embeddings = Var::randn(0f32, 0.02, (vocab * n, d), device)?;

        let stack = |module: &str, dim: usize, layers: usize| -> Result<Vec<LoRALinear>> {
            (0..layers)
                .map(|_| {
                    let layer = LoRALinear::new(dim, dim, true, device)?;
                    match &config.lora {
                        Some(lora) if lora.targets(module) => layer.with_adapter(lora, device),
                        _ => Ok(layer),
                    }
                })
                .collect()
        };
        let single = |module: &str, input: usize, output: usize| -> Result<LoRALinear> {
            let layer = LoRALinear::new(input, output, false, device)?;
            match &config.lora {
                Some(lora) if lora.targets(module) => layer.with_adapter(lora, device),
                _ => Ok(layer),
            }
        };

        let backbone = stack("backbone", d, config.backbone_layers)?;
        let decoder = stack("decoder", dd, config.decoder_layers)?;
        let codebook0_head = single("codebook0_head", d, vocab)?;
        let projection = single("projection", d, dd)?;
        let audio_head = (1..n)
            .map(|_| Var::randn(0f32, 0.02, (dd, vocab), device))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let model = Self {
            config,
            device: device.clone(),
            text_embeddings,
            audio_embeddings,
            backbone,
            codebook0_head,
            projection,
            decoder,
            audio_head,
        };
        tracing::debug!(
            "Created reference model with {} parameters ({} trainable)",
            model.parameters().num_elements(),
            model.trainable_parameters().num_elements()
        );
        Ok(model)
    }

    pub fn config(&self) -> &ReferenceConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn residual_stack(layers: &[LoRALinear], input: &Tensor) -> Result<Tensor> {
        let mut hidden = input.clone();
        for layer in layers {
            hidden = hidden.add(&layer.forward(&hidden)?.tanh()?)?;
        }
        Ok(hidden)
    }
}

/// Row lookup keeping the id shape: `[..] -> [.., dim]`
fn lookup(table: &Tensor, ids: &Tensor) -> Result<Tensor> {
    let (_, dim) = table.dims2()?;
    let rows = table.index_select(&ids.flatten_all()?, 0)?;
    let mut shape = ids.dims().to_vec();
    shape.push(dim);
    Ok(rows.reshape(shape)?)
}

impl SpeechModel for ReferenceModel {
    fn n_audio_codebooks(&self) -> usize {
        self.config.n_audio_codebooks
    }

    fn embed_tokens(&self, tokens: &Tensor) -> Result<Tensor> {
        let n = self.config.n_audio_codebooks;
        let mut slots = Vec::with_capacity(n + 1);
        for codebook in 0..n {
            let ids = tokens.narrow(2, codebook, 1)?.squeeze(2)?;
            slots.push(self.embed_audio(codebook, &ids)?);
        }
        let text = tokens.narrow(2, n, 1)?.squeeze(2)?;
        slots.push(lookup(self.text_embeddings.as_tensor(), &text)?);
        Ok(Tensor::stack(&slots, 2)?)
    }

    fn embed_audio(&self, codebook: usize, tokens: &Tensor) -> Result<Tensor> {
        let offset = (codebook * self.config.audio_vocab_size) as u32;
        let offset = Tensor::new(offset, &self.device)?;
        let ids = tokens.to_dtype(candle_core::DType::U32)?.broadcast_add(&offset)?;
        lookup(self.audio_embeddings.as_tensor(), &ids)
    }

    fn backbone(&self, input: &Tensor) -> Result<Tensor> {
        Self::residual_stack(&self.backbone, input)
    }

    fn codebook0_head(&self, hidden: &Tensor) -> Result<Tensor> {
        self.codebook0_head.forward(hidden)
    }

    fn projection(&self, input: &Tensor) -> Result<Tensor> {
        self.projection.forward(input)
    }

    fn decoder(&self, input: &Tensor) -> Result<Tensor> {
        Self::residual_stack(&self.decoder, input)
    }

    fn audio_head(&self, index: usize) -> Result<&Tensor> {
        self.audio_head
            .get(index)
            .map(|v| v.as_tensor())
            .ok_or_else(|| FinetuneError::WeightNotFound(format!("audio_head.{}", index)))
    }

    fn parameters(&self) -> ParamTree {
        ParamTree::node([
            ("text_embeddings", ParamTree::node([("weight", ParamTree::Leaf(self.text_embeddings.clone()))])),
            ("audio_embeddings", ParamTree::node([("weight", ParamTree::Leaf(self.audio_embeddings.clone()))])),
            ("backbone", ParamTree::node([(
                "layers",
                ParamTree::Seq(self.backbone.iter().map(LoRALinear::parameters).collect()),
            )])),
            ("codebook0_head", self.codebook0_head.parameters()),
            ("projection", self.projection.parameters()),
            ("decoder", ParamTree::node([(
                "layers",
                ParamTree::Seq(self.decoder.iter().map(LoRALinear::parameters).collect()),
            )])),
            ("audio_head", ParamTree::seq_of_vars(&self.audio_head)),
        ])
    }

    fn trainable_parameters(&self) -> ParamTree {
        if self.config.lora.is_none() {
            return self.parameters();
        }

        // With adapters attached the base weights are frozen. Keyed by layer
        // index so names line up with `parameters` when some layers are skipped
        let adapters = |layers: &[LoRALinear]| {
            ParamTree::node(
                layers
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| l.adapter.is_some())
                    .map(|(i, l)| (i.to_string(), l.trainable_parameters())),
            )
        };
        let mut entries = vec![
            ("backbone", ParamTree::node([("layers", adapters(&self.backbone))])),
            ("decoder", ParamTree::node([("layers", adapters(&self.decoder))])),
        ];
        if self.codebook0_head.adapter.is_some() {
            entries.push(("codebook0_head", self.codebook0_head.trainable_parameters()));
        }
        if self.projection.adapter.is_some() {
            entries.push(("projection", self.projection.trainable_parameters()));
        }
        ParamTree::node(entries)
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, &self.device)?;
        let params = self.parameters().flatten();

        for (name, tensor) in &tensors {
            let var = params
                .get(name)
                .ok_or_else(|| FinetuneError::WeightNotFound(name.clone()))?;
            if var.dims() != tensor.dims() {
                return Err(FinetuneError::shape_mismatch(name, var.dims(), tensor.dims()));
            }
            var.set(&tensor.to_dtype(var.dtype())?)?;
        }

        tracing::debug!("Loaded {} tensors from {}", tensors.len(), path.display());
        Ok(())
    }
}
