//! Batch providers for training

use candle_core::{DType, Device, Tensor};
use std::path::Path;

use crate::error::{FinetuneError, Result};

/// Source of `(tokens, masks)` training batches
pub trait Dataset {
    /// Number of samples
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch the samples at `indices` as `[batch, seq, codebooks + 1]` token and
    /// mask tensors
    fn get_batch(&self, indices: &[usize]) -> Result<(Tensor, Tensor)>;
}

/// Pre-tokenized samples held in memory.
///
/// Each sample is a `[seq, codebooks + 1]` pair of token ids (`u32`) and
/// masks (`f32`). Batches are right-padded to the longest sample with token 0
/// and mask 0.
pub struct InMemoryDataset {
    samples: Vec<(Tensor, Tensor)>,
    device: Device,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<(Tensor, Tensor)>, device: &Device) -> Result<Self> {
        let mut width = None;
        for (i, (tokens, masks)) in samples.iter().enumerate() {
            let (_, slots) = tokens.dims2()?;
            if masks.dims() != tokens.dims() {
                return Err(FinetuneError::shape_mismatch(
                    format!("masks.{}", i),
                    tokens.dims(),
                    masks.dims(),
                ));
            }
            match width {
                None => width = Some(slots),
                Some(w) if w != slots => {
                    return Err(FinetuneError::invalid_batch(format!(
                        "sample {} has {} token slots, expected {}",
                        i, slots, w
                    )));
                }
                _ => {}
            }
        }

        let samples = samples
            .into_iter()
            .map(|(tokens, masks)| -> Result<_> {
                Ok((
                    tokens.to_dtype(DType::U32)?.to_device(device)?,
                    masks.to_dtype(DType::F32)?.to_device(device)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            samples,
            device: device.clone(),
        })
    }

    /// Load samples stored as `tokens.{i}` / `masks.{i}` in a safetensors file
    pub fn from_safetensors(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, device)?;

        let mut indices: Vec<usize> = tensors
            .keys()
            .filter_map(|k| k.strip_prefix("tokens.").and_then(|i| i.parse().ok()))
            .collect();
        indices.sort_unstable();

        let mut samples = Vec::with_capacity(indices.len());
        for i in indices {
            let tokens = tensors
                .remove(&format!("tokens.{}", i))
                .ok_or_else(|| FinetuneError::WeightNotFound(format!("tokens.{}", i)))?;
            let masks = tensors
                .remove(&format!("masks.{}", i))
                .ok_or_else(|| FinetuneError::WeightNotFound(format!("masks.{}", i)))?;
            samples.push((tokens, masks));
        }

        tracing::info!("Loaded {} samples from {}", samples.len(), path.display());
        Self::new(samples, device)
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get_batch(&self, indices: &[usize]) -> Result<(Tensor, Tensor)> {
        if indices.is_empty() {
            return Err(FinetuneError::invalid_batch("empty index list"));
        }

        let picked = indices
            .iter()
            .map(|&i| {
                self.samples.get(i).ok_or_else(|| {
                    FinetuneError::invalid_batch(format!(
                        "index {} out of range for {} samples",
                        i,
                        self.samples.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let max_len = picked
            .iter()
            .map(|(tokens, _)| tokens.dim(0))
            .collect::<candle_core::Result<Vec<_>>>()?
            .into_iter()
            .max()
            .unwrap_or(0);

        let mut tokens = Vec::with_capacity(picked.len());
        let mut masks = Vec::with_capacity(picked.len());
        for (t, m) in picked {
            tokens.push(pad_to(t, max_len, &self.device)?);
            masks.push(pad_to(m, max_len, &self.device)?);
        }

        Ok((Tensor::stack(&tokens, 0)?, Tensor::stack(&masks, 0)?))
    }
}

/// Right-pad a `[seq, slots]` tensor with zeros to `len` rows
fn pad_to(t: &Tensor, len: usize, device: &Device) -> Result<Tensor> {
    let (rows, slots) = t.dims2()?;
    if rows == len {
        return Ok(t.clone());
    }
    let padding = Tensor::zeros((len - rows, slots), t.dtype(), device)?;
    Ok(Tensor::cat(&[t, &padding], 0)?)
}
