//! Configuration management for csm-finetune.
//!
//! Configuration is loaded from several sources:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file
//! 3. Environment variables (prefixed with `CSM_FINETUNE`, sections separated by `__`)
//! 4. Command-line arguments
//!
//! Later sources override earlier ones.
//!
//! # Environment Variables
//!
//! - `CSM_FINETUNE__TRAINING__EPOCHS` - Number of epochs
//! - `CSM_FINETUNE__TRAINING__LEARNING_RATE` - Initial learning rate
//! - `CSM_FINETUNE__CHECKPOINT__DIR` - Checkpoint directory
//! - `CSM_FINETUNE__FINETUNE__MODE` - `full` or `lora`

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{FinetuneError, Result};
use crate::lora::LoRAConfig;
use crate::reference::ReferenceConfig;
use crate::training::{FinetuneMode, TrainerConfig};

/// Command-line arguments
#[derive(Debug, Default, Parser)]
#[clap(version, about)]
pub struct Args {
    /// Configuration file path
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Training data (safetensors with `tokens.{i}` / `masks.{i}`)
    #[clap(short, long)]
    pub data: Option<PathBuf>,

    /// Checkpoint directory
    #[clap(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Finetuning mode (full, lora)
    #[clap(long)]
    pub mode: Option<String>,

    /// Also train embedding tables in lora mode
    #[clap(long)]
    pub train_embeddings: Option<bool>,

    /// Number of epochs
    #[clap(long)]
    pub epochs: Option<usize>,

    /// Batch size
    #[clap(long)]
    pub batch_size: Option<usize>,

    /// Initial learning rate
    #[clap(long)]
    pub learning_rate: Option<f64>,

    /// Base model weights to load before training
    #[clap(long)]
    pub base_weights: Option<PathBuf>,

    /// Resume from a checkpoint weights file
    #[clap(long, conflicts_with = "resume_latest")]
    pub resume: Option<PathBuf>,

    /// Resume from the latest checkpoint in the checkpoint directory
    #[clap(long)]
    pub resume_latest: bool,

    /// Force CPU even when CUDA is available
    #[clap(long)]
    pub cpu: bool,
}

/// Finetuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetuneConfig {
    pub training: TrainingSettings,
    pub checkpoint: CheckpointSettings,
    pub finetune: FinetuneSettings,
    pub model: ModelSettings,
    #[serde(default)]
    pub data: DataSettings,
}

/// Optimization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

/// Checkpoint and history settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    /// Save every N steps (0 = never)
    #[serde(default = "default_save_every")]
    pub save_every: usize,
    /// Record history every N steps (0 = never)
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    /// Step checkpoints to keep (0 = all)
    #[serde(default)]
    pub keep_last: usize,
    #[serde(default)]
    pub save_best: bool,
}

/// Finetuning variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetuneSettings {
    /// `full` or `lora`
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub train_embeddings: bool,
}

/// Reference model dimensions and adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub n_audio_codebooks: usize,
    pub audio_vocab_size: usize,
    pub text_vocab_size: usize,
    pub backbone_dim: usize,
    pub decoder_dim: usize,
    pub backbone_layers: usize,
    pub decoder_layers: usize,
    #[serde(default = "default_lora_rank")]
    pub lora_rank: usize,
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: f32,
    #[serde(default = "default_lora_targets")]
    pub lora_targets: Vec<String>,
    /// Weights loaded into the model before training
    #[serde(default)]
    pub base_weights: Option<PathBuf>,
}

/// Training data location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSettings {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl FinetuneConfig {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            include_str!("../config/default.toml"),
            config::FileFormat::Toml,
        ));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        // Add environment variables
        builder = builder.add_source(
            config::Environment::with_prefix("CSM_FINETUNE")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: FinetuneConfig = builder.build()?.try_deserialize()?;

        // Override with command line args
        if let Some(path) = &args.data {
            config.data.path = Some(path.clone());
        }
        if let Some(dir) = &args.checkpoint_dir {
            config.checkpoint.dir = dir.clone();
        }
        if let Some(mode) = &args.mode {
            config.finetune.mode = mode.clone();
        }
        if let Some(train_embeddings) = args.train_embeddings {
            config.finetune.train_embeddings = train_embeddings;
        }
        if let Some(epochs) = args.epochs {
            config.training.epochs = epochs;
        }
        if let Some(batch_size) = args.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(learning_rate) = args.learning_rate {
            config.training.learning_rate = learning_rate;
        }
        if let Some(path) = &args.base_weights {
            config.model.base_weights = Some(path.clone());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.training.batch_size == 0 {
            return Err(FinetuneError::config("batch_size must be at least 1"));
        }
        self.finetune_mode()?;
        self.trainer_config().validate()?;
        self.reference_config()?.validate()
    }

    /// Parsed finetuning variant
    pub fn finetune_mode(&self) -> Result<FinetuneMode> {
        match self.finetune.mode.to_lowercase().as_str() {
            "full" => Ok(FinetuneMode::Full),
            "lora" => Ok(FinetuneMode::Lora {
                train_embeddings: self.finetune.train_embeddings,
            }),
            other => Err(FinetuneError::config(format!(
                "unknown finetune mode '{}', expected 'full' or 'lora'",
                other
            ))),
        }
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig {
            checkpoint_dir: self.checkpoint.dir.clone(),
            learning_rate: self.training.learning_rate,
            weight_decay: self.training.weight_decay,
            save_every: self.checkpoint.save_every,
            log_every: self.checkpoint.log_every,
            keep_last: self.checkpoint.keep_last,
            save_best: self.checkpoint.save_best,
            seed: self.training.seed,
        }
    }

    /// Reference model config; adapters are attached in lora mode only
    pub fn reference_config(&self) -> Result<ReferenceConfig> {
        let model = &self.model;
        let config = ReferenceConfig {
            n_audio_codebooks: model.n_audio_codebooks,
            audio_vocab_size: model.audio_vocab_size,
            text_vocab_size: model.text_vocab_size,
            backbone_dim: model.backbone_dim,
            decoder_dim: model.decoder_dim,
            backbone_layers: model.backbone_layers,
            decoder_layers: model.decoder_layers,
            lora: None,
        };

        Ok(match self.finetune_mode()? {
            FinetuneMode::Full => config,
            FinetuneMode::Lora { .. } => config.with_lora(LoRAConfig {
                rank: model.lora_rank,
                alpha: model.lora_alpha,
                target_modules: model.lora_targets.clone(),
            }),
        })
    }
}

fn default_batch_size() -> usize {
    2
}

fn default_epochs() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

fn default_learning_rate() -> f64 {
    1e-5
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_save_every() -> usize {
    100
}

fn default_log_every() -> usize {
    10
}

fn default_mode() -> String {
    "full".to_string()
}

fn default_lora_rank() -> usize {
    8
}

fn default_lora_alpha() -> f32 {
    16.0
}

fn default_lora_targets() -> Vec<String> {
    LoRAConfig::default().target_modules
}
