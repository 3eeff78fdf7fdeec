//! Common test utilities for csm-finetune integration tests

#![allow(dead_code)]

use candle_core::{Device, Tensor};
use csm_finetune::{
    dataset::InMemoryDataset,
    lora::LoRAConfig,
    params::FlatParams,
    reference::{ReferenceConfig, ReferenceModel},
    training::TrainerConfig,
    Result,
};
use std::path::Path;

/// Small reference model dimensions with `n_audio` codebooks
pub fn tiny_config(n_audio: usize) -> ReferenceConfig {
    ReferenceConfig {
        n_audio_codebooks: n_audio,
        audio_vocab_size: 16,
        text_vocab_size: 32,
        backbone_dim: 16,
        decoder_dim: 8,
        backbone_layers: 1,
        decoder_layers: 1,
        lora: None,
    }
}

pub fn tiny_lora_config(n_audio: usize) -> ReferenceConfig {
    tiny_config(n_audio).with_lora(LoRAConfig {
        rank: 2,
        alpha: 4.0,
        target_modules: vec!["backbone".to_string(), "decoder".to_string()],
    })
}

pub fn tiny_model(config: ReferenceConfig) -> ReferenceModel {
    ReferenceModel::new(config, &Device::Cpu).expect("failed to build reference model")
}

/// Deterministic `[seq, n_audio + 1]` token ids, varied by `seed`
pub fn sample_tokens(config: &ReferenceConfig, seq: usize, seed: usize) -> Result<Tensor> {
    let slots = config.n_audio_codebooks + 1;
    let ids: Vec<u32> = (0..seq)
        .flat_map(|t| {
            (0..slots).map(move |s| ((seed * 31 + t * 7 + s * 13 + 5) % config.audio_vocab_size) as u32)
        })
        .collect();
    Ok(Tensor::from_vec(ids, (seq, slots), &Device::Cpu)?)
}

/// Fully unmasked `[batch, seq, n_audio + 1]` batch
pub fn synthetic_batch(config: &ReferenceConfig, batch: usize, seq: usize) -> Result<(Tensor, Tensor)> {
    let samples = (0..batch)
        .map(|b| sample_tokens(config, seq, b))
        .collect::<Result<Vec<_>>>()?;
    let tokens = Tensor::stack(&samples, 0)?;
    let masks = tokens.ones_like()?.to_dtype(candle_core::DType::F32)?;
    Ok((tokens, masks))
}

/// Dataset of `len` samples with lengths cycling between 4 and 6 steps
pub fn synthetic_dataset(config: &ReferenceConfig, len: usize) -> Result<InMemoryDataset> {
    let device = Device::Cpu;
    let samples = (0..len)
        .map(|i| -> Result<(Tensor, Tensor)> {
            let seq = 4 + i % 3;
            let tokens = sample_tokens(config, seq, i)?;
            let masks = tokens.ones_like()?.to_dtype(candle_core::DType::F32)?;
            Ok((tokens, masks))
        })
        .collect::<Result<Vec<_>>>()?;
    InMemoryDataset::new(samples, &device)
}

/// Trainer config writing into `dir` with both step triggers disabled
pub fn quiet_trainer_config(dir: &Path) -> TrainerConfig {
    TrainerConfig::new(dir)
        .with_learning_rate(1e-2)
        .with_intervals(0, 0)
}

/// Flattened parameter values keyed by name
pub fn snapshot(params: &FlatParams) -> Vec<(String, Vec<f32>)> {
    params
        .iter()
        .map(|(name, var)| {
            let values = var
                .as_tensor()
                .flatten_all()
                .and_then(|t| t.to_vec1::<f32>())
                .expect("failed to read parameter");
            (name.clone(), values)
        })
        .collect()
}
