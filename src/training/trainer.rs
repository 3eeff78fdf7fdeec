//! Training loop for backbone/decoder speech models

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::checkpoint::{CheckpointInfo, CheckpointManager, OptimizerState, TrainingHistory};
use super::variant::{FinetuneMode, ParamSelection};
use crate::dataset::Dataset;
use crate::error::{FinetuneError, Result};
use crate::loss::compute_loss;
use crate::model::SpeechModel;

/// Trainer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Directory for checkpoints and history
    pub checkpoint_dir: PathBuf,

    /// Initial learning rate
    pub learning_rate: f64,

    /// Decoupled weight decay
    pub weight_decay: f64,

    /// Save a step checkpoint every N steps (0 = never)
    pub save_every: usize,

    /// Record history every N steps (0 = never)
    pub log_every: usize,

    /// Step checkpoints to keep (0 = all)
    pub keep_last: usize,

    /// Save `{prefix}_best` whenever the epoch-average loss improves
    pub save_best: bool,

    /// Seed for batch shuffling
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            learning_rate: 1e-5,
            weight_decay: 0.01,
            save_every: 100,
            log_every: 10,
            keep_last: 0,
            save_best: false,
            seed: 42,
        }
    }
}

impl TrainerConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_intervals(mut self, save_every: usize, log_every: usize) -> Self {
        self.save_every = save_every;
        self.log_every = log_every;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(FinetuneError::config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(FinetuneError::config("weight_decay must be non-negative"));
        }
        Ok(())
    }
}

/// Counters carried across steps and persisted in checkpoints
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    pub step: usize,

    /// Lowest epoch-average loss seen
    pub best_loss: Option<f32>,

    /// Loss of the most recent step
    pub last_loss: Option<f32>,
}

/// Drives optimization of a [`SpeechModel`] over a [`Dataset`]
pub struct Trainer<M: SpeechModel, O: Optimizer = AdamW> {
    model: M,
    optimizer: O,
    selection: ParamSelection,
    checkpoints: CheckpointManager,
    config: TrainerConfig,
    state: TrainingState,
    history: TrainingHistory,
    device: Device,
    rng: StdRng,
}

impl<M: SpeechModel> Trainer<M, AdamW> {
    /// Trainer with an AdamW optimizer over the variant's trainable set
    pub fn new(model: M, mode: FinetuneMode, config: TrainerConfig, device: &Device) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        Self::with_optimizer(model, mode, config, device, |vars| AdamW::new(vars, params))
    }
}

impl<M: SpeechModel, O: Optimizer> Trainer<M, O> {
    /// Trainer with a caller-built optimizer over the variant's trainable set
    pub fn with_optimizer<F>(
        model: M,
        mode: FinetuneMode,
        config: TrainerConfig,
        device: &Device,
        build: F,
    ) -> Result<Self>
    where
        F: FnOnce(Vec<Var>) -> candle_core::Result<O>,
    {
        config.validate()?;

        let selection = mode.select(&model);
        if selection.is_empty() {
            return Err(FinetuneError::config("model has no trainable parameters"));
        }
        let optimizer = build(selection.vars())?;

        let checkpoints = CheckpointManager::new(&config.checkpoint_dir, mode.checkpoint_prefix())?
            .with_keep_last(config.keep_last);
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            model,
            optimizer,
            selection,
            checkpoints,
            config,
            state: TrainingState::default(),
            history: TrainingHistory::default(),
            device: device.clone(),
            rng,
        })
    }

    /// Loss of a batch without updating anything
    pub fn compute_loss(&self, tokens: &Tensor, masks: &Tensor) -> Result<Tensor> {
        let tokens = tokens.to_device(&self.device)?;
        let masks = masks.to_device(&self.device)?;
        compute_loss(&self.model, &tokens, &masks)
    }

    /// One optimizer update on a batch; returns the batch loss
    pub fn train_step(&mut self, tokens: &Tensor, masks: &Tensor) -> Result<f32> {
        let loss = self.compute_loss(tokens, masks)?;
        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;

        let loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        self.state.step += 1;
        self.state.last_loss = Some(loss);
        let step = self.state.step;
        tracing::debug!("Step {} - loss: {:.4}", step, loss);

        if self.config.log_every > 0 && step % self.config.log_every == 0 {
            let lr = self.optimizer.learning_rate();
            self.history.record(loss, step, lr);
            self.checkpoints.write_history(&self.history)?;
            tracing::info!("Step {} - loss: {:.4}, lr: {:.2e}", step, loss, lr);
        }

        if self.config.save_every > 0 && step % self.config.save_every == 0 {
            self.save_checkpoint(None)?;
        }

        Ok(loss)
    }

    /// Run `epochs` passes over `dataset`
    pub fn train<D: Dataset + ?Sized>(
        &mut self,
        dataset: &D,
        batch_size: usize,
        epochs: usize,
        shuffle: bool,
    ) -> Result<TrainingHistory> {
        if dataset.is_empty() {
            return Err(FinetuneError::EmptyDataset);
        }
        if batch_size == 0 {
            return Err(FinetuneError::config("batch_size must be at least 1"));
        }

        let num_batches = dataset.len().div_ceil(batch_size);
        tracing::info!(
            "Training on {} samples: {} batches per epoch, {} epochs",
            dataset.len(),
            num_batches,
            epochs
        );

        for epoch in 1..=epochs {
            let mut indices: Vec<usize> = (0..dataset.len()).collect();
            if shuffle {
                indices.shuffle(&mut self.rng);
            }

            let pb = ProgressBar::new(num_batches as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.green/black} {pos}/{len} [{elapsed}<{eta}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );

            let mut epoch_loss = 0.0;
            for chunk in indices.chunks(batch_size) {
                let (tokens, masks) = dataset.get_batch(chunk)?;
                let loss = self.train_step(&tokens, &masks)?;
                epoch_loss += loss;
                pb.set_message(format!("epoch {} | loss: {:.4} | step: {}", epoch, loss, self.state.step));
                pb.inc(1);
            }
            pb.finish_and_clear();

            let avg_loss = epoch_loss / num_batches as f32;
            tracing::info!("Epoch {}/{} - average loss: {:.4}", epoch, epochs, avg_loss);

            let improved = self.state.best_loss.map_or(true, |best| avg_loss < best);
            if improved {
                self.state.best_loss = Some(avg_loss);
            }

            self.save_with_loss(Some(&format!("epoch_{}", epoch)), Some(avg_loss), Some(epoch))?;
            if improved && self.config.save_best {
                self.save_with_loss(Some("best"), Some(avg_loss), Some(epoch))?;
            }
        }

        Ok(self.history.clone())
    }

    /// Save the variant's parameters and the optimizer state
    pub fn save_checkpoint(&self, suffix: Option<&str>) -> Result<PathBuf> {
        self.save_with_loss(suffix, self.state.last_loss, None)
    }

    fn save_with_loss(&self, suffix: Option<&str>, loss: Option<f32>, epoch: Option<usize>) -> Result<PathBuf> {
        let info = CheckpointInfo {
            optimizer: OptimizerState {
                step: self.state.step,
                learning_rate: self.optimizer.learning_rate(),
            },
            loss,
            best_loss: self.state.best_loss,
            epoch,
            timestamp: chrono::Utc::now().timestamp(),
        };
        let params = self.selection.params_to_save(&self.model);
        self.checkpoints.save(&params, &info, suffix)
    }

    /// Load weights and resume counters from a checkpoint
    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.model.load_weights(path)?;

        match CheckpointManager::restore_state(path)? {
            Some(restored) => {
                self.state.step = restored.optimizer.step;
                self.optimizer.set_learning_rate(restored.optimizer.learning_rate);
                if restored.best_loss.is_some() {
                    self.state.best_loss = restored.best_loss;
                }
                tracing::info!(
                    "Restored step {} and learning rate {:.2e}",
                    restored.optimizer.step,
                    restored.optimizer.learning_rate
                );
            }
            None => tracing::warn!("No optimizer state found for {}", path.display()),
        }

        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        if let Some(mut history) = CheckpointManager::read_history(dir)? {
            history.truncate_after(self.state.step);
            self.history = history;
        }

        tracing::info!("Loaded checkpoint from {}", path.display());
        Ok(())
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn selection(&self) -> &ParamSelection {
        &self.selection
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
