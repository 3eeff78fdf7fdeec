//! Linear layers with an optional low-rank adapter

use candle_core::{DType, Device, Tensor, Var};

use super::{validate_lora_config, LoRAConfig};
use crate::error::Result;
use crate::params::ParamTree;

/// A single LoRA adapter
#[derive(Debug, Clone)]
pub struct LoRALayer {
    /// LoRA A matrix [in_features, rank] - trainable
    pub lora_a: Var,

    /// LoRA B matrix [rank, out_features] - trainable
    pub lora_b: Var,

    /// Scaling factor (alpha / rank)
    pub scaling: f64,
}

impl LoRALayer {
    /// Create a new adapter with Kaiming-uniform A and zero B, so it starts as a no-op
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: &LoRAConfig,
        device: &Device,
    ) -> Result<Self> {
        validate_lora_config(config.rank, in_features, out_features)?;

        let gain = 5.0_f64.sqrt();
        let std = gain / (in_features as f64).sqrt();
        let bound = 3.0_f64.sqrt() * std;

        let lora_a = Var::from_tensor(&Tensor::rand(
            -bound as f32,
            bound as f32,
            (in_features, config.rank),
            device,
        )?)?;
        let lora_b = Var::zeros((config.rank, out_features), DType::F32, device)?;

        Ok(Self {
            lora_a,
            lora_b,
            scaling: config.scaling(),
        })
    }

    /// Low-rank update for `x`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Batched matmul rejects strided inputs
        let x = x.contiguous()?;
        let hidden = x.broadcast_matmul(self.lora_a.as_tensor())?;
        let output = hidden.broadcast_matmul(self.lora_b.as_tensor())?;
        Ok(output.affine(self.scaling, 0.0)?)
    }

    /// Number of trainable parameters
    pub fn num_parameters(&self) -> usize {
        self.lora_a.elem_count() + self.lora_b.elem_count()
    }

    fn params(&self) -> Vec<(&'static str, ParamTree)> {
        vec![
            ("lora_a", ParamTree::Leaf(self.lora_a.clone())),
            ("lora_b", ParamTree::Leaf(self.lora_b.clone())),
        ]
    }
}

/// Linear projection `x @ W^T + b`, optionally adapted
#[derive(Debug, Clone)]
pub struct LoRALinear {
    /// Base weight [out_features, in_features]
    pub weight: Var,

    /// Optional base bias [out_features]
    pub bias: Option<Var>,

    /// Attached adapter, if any
    pub adapter: Option<LoRALayer>,
}

impl LoRALinear {
    /// Randomly initialised projection without an adapter
    pub fn new(in_features: usize, out_features: usize, bias: bool, device: &Device) -> Result<Self> {
        let bound = 1.0 / (in_features as f64).sqrt();
        let weight = Var::from_tensor(&Tensor::rand(
            -bound as f32,
            bound as f32,
            (out_features, in_features),
            device,
        )?)?;
        let bias = if bias {
            Some(Var::zeros(out_features, DType::F32, device)?)
        } else {
            None
        };

        Ok(Self {
            weight,
            bias,
            adapter: None,
        })
    }

    /// Attach a fresh adapter
    pub fn with_adapter(mut self, config: &LoRAConfig, device: &Device) -> Result<Self> {
        let (out_features, in_features) = self.weight.dims2()?;
        self.adapter = Some(LoRALayer::new(in_features, out_features, config, device)?);
        Ok(self)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.contiguous()?;
        let mut output = x.broadcast_matmul(&self.weight.as_tensor().t()?)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias.as_tensor())?;
        }
        if let Some(adapter) = &self.adapter {
            output = output.add(&adapter.forward(&x)?)?;
        }
        Ok(output)
    }

    /// Every parameter, base and adapter
    pub fn parameters(&self) -> ParamTree {
        let mut entries = vec![("weight", ParamTree::Leaf(self.weight.clone()))];
        if let Some(bias) = &self.bias {
            entries.push(("bias", ParamTree::Leaf(bias.clone())));
        }
        if let Some(adapter) = &self.adapter {
            entries.extend(adapter.params());
        }
        ParamTree::node(entries)
    }

    /// Adapter parameters when an adapter is attached, otherwise everything
    pub fn trainable_parameters(&self) -> ParamTree {
        match &self.adapter {
            Some(adapter) => ParamTree::node(adapter.params()),
            None => self.parameters(),
        }
    }
}
