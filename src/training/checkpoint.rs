//! Checkpoint management
//!
//! A checkpoint directory holds:
//! - `{prefix}_step_{N}.safetensors` / `{prefix}_{suffix}.safetensors`: flat weights
//! - `{same stem}.json`: versioned sidecar with step, learning rate and losses
//! - `optimizer_state.json`: `{step, learning_rate}` of the most recent save
//! - `history.json`: the recorded loss / learning-rate / step log
//!
//! Restoring prefers the sidecar of the weights file being loaded; the shared
//! `optimizer_state.json` is only consulted when no sidecar exists, and then
//! reflects the latest save in that directory rather than the loaded weights.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FinetuneError, Result};
use crate::params::ParamTree;

pub const OPTIMIZER_STATE_FILE: &str = "optimizer_state.json";
pub const HISTORY_FILE: &str = "history.json";
pub const WEIGHTS_EXTENSION: &str = "safetensors";

/// Step counter and learning rate, as written to `optimizer_state.json`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
}

/// Per-checkpoint metadata stored next to the weights file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    #[serde(flatten)]
    pub optimizer: OptimizerState,

    /// Loss at the time of the save (step loss, or epoch average for epoch checkpoints)
    pub loss: Option<f32>,

    /// Lowest epoch-average loss seen so far
    pub best_loss: Option<f32>,

    /// Epoch that produced `loss`; absent for step checkpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<usize>,

    /// Timestamp (seconds since epoch)
    pub timestamp: i64,
}

/// Append-only log of recorded losses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub loss: Vec<f32>,
    pub learning_rate: Vec<f64>,
    pub step: Vec<usize>,
}

impl TrainingHistory {
    pub fn record(&mut self, loss: f32, step: usize, learning_rate: f64) {
        self.loss.push(loss);
        self.step.push(step);
        self.learning_rate.push(learning_rate);
    }

    pub fn len(&self) -> usize {
        self.step.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step.is_empty()
    }

    /// Drop entries recorded after `step`
    pub fn truncate_after(&mut self, step: usize) {
        let keep = self.step.iter().take_while(|&&s| s <= step).count();
        self.loss.truncate(keep);
        self.learning_rate.truncate(keep);
        self.step.truncate(keep);
    }
}

/// Training state recovered from disk
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    pub optimizer: OptimizerState,
    pub best_loss: Option<f32>,
    /// Whether the state came from the checkpoint's own sidecar
    pub versioned: bool,
}

/// A weights file found in a checkpoint directory
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub path: PathBuf,
    pub step: usize,
    pub info: Option<CheckpointInfo>,
}

/// Manages checkpoint saving and loading for one directory and prefix
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    /// Directory to save checkpoints
    checkpoint_dir: PathBuf,

    /// File name prefix (`ckpt`, `lora_ckpt`)
    prefix: String,

    /// Number of step checkpoints to keep (0 = keep all)
    keep_last: usize,
}

impl CheckpointManager {
    /// Create new checkpoint manager, creating the directory if needed
    pub fn new(checkpoint_dir: impl AsRef<Path>, prefix: impl Into<String>) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self {
            checkpoint_dir,
            prefix: prefix.into(),
            keep_last: 0,
        })
    }

    /// Set number of step checkpoints to keep
    pub fn with_keep_last(mut self, keep_last: usize) -> Self {
        self.keep_last = keep_last;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Weights file name for a save at `step`, or tagged with `suffix`
    pub fn weights_path(&self, step: usize, suffix: Option<&str>) -> PathBuf {
        let name = match suffix {
            Some(suffix) => format!("{}_{}.{}", self.prefix, suffix, WEIGHTS_EXTENSION),
            None => format!("{}_step_{}.{}", self.prefix, step, WEIGHTS_EXTENSION),
        };
        self.checkpoint_dir.join(name)
    }

    /// Flatten and write `params`, the sidecar and the shared optimizer state
    pub fn save(
        &self,
        params: &ParamTree,
        info: &CheckpointInfo,
        suffix: Option<&str>,
    ) -> Result<PathBuf> {
        let checkpoint_path = self.weights_path(info.optimizer.step, suffix);
        if let Some(parent) = checkpoint_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tensors: HashMap<String, candle_core::Tensor> = params
            .flatten()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, &checkpoint_path)?;

        fs::write(
            checkpoint_path.with_extension("json"),
            serde_json::to_string_pretty(info)?,
        )?;
        fs::write(
            self.checkpoint_dir.join(OPTIMIZER_STATE_FILE),
            serde_json::to_string_pretty(&info.optimizer)?,
        )?;

        tracing::info!(
            "Saved checkpoint to {} ({} tensors, step {})",
            checkpoint_path.display(),
            tensors.len(),
            info.optimizer.step
        );

        if suffix.is_none() {
            self.cleanup_old_checkpoints()?;
        }

        Ok(checkpoint_path)
    }

    /// Rewrite the full history file
    pub fn write_history(&self, history: &TrainingHistory) -> Result<()> {
        fs::write(
            self.checkpoint_dir.join(HISTORY_FILE),
            serde_json::to_string_pretty(history)?,
        )?;
        Ok(())
    }

    /// Read `history.json` from `dir` if present
    pub fn read_history(dir: &Path) -> Result<Option<TrainingHistory>> {
        let path = dir.join(HISTORY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    /// Sidecar metadata of a weights file, if present
    pub fn read_info(weights_path: &Path) -> Result<Option<CheckpointInfo>> {
        let path = weights_path.with_extension("json");
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    /// Shared `optimizer_state.json` in `dir`, if present
    pub fn read_optimizer_state(dir: &Path) -> Result<Option<OptimizerState>> {
        let path = dir.join(OPTIMIZER_STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    /// State to resume from when loading `weights_path`
    pub fn restore_state(weights_path: &Path) -> Result<Option<RestoredState>> {
        if let Some(info) = Self::read_info(weights_path)? {
            return Ok(Some(RestoredState {
                optimizer: info.optimizer,
                best_loss: info.best_loss,
                versioned: true,
            }));
        }

        let dir = weights_path.parent().unwrap_or_else(|| Path::new(""));
        Ok(Self::read_optimizer_state(dir)?.map(|optimizer| {
            tracing::warn!(
                "No sidecar for {}, using shared {} (step {})",
                weights_path.display(),
                OPTIMIZER_STATE_FILE,
                optimizer.step
            );
            RestoredState {
                optimizer,
                best_loss: None,
                versioned: false,
            }
        }))
    }

    /// All checkpoints with this prefix, sorted by step
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointEntry>> {
        if !self.checkpoint_dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if path.extension() != Some(std::ffi::OsStr::new(WEIGHTS_EXTENSION)) {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if stem.starts_with(&format!("{}_", self.prefix)) => stem.to_string(),
                _ => continue,
            };

            let info = Self::read_info(&path)?;
            let step = match (&info, self.parse_step(&stem)) {
                (Some(info), _) => info.optimizer.step,
                (None, Some(step)) => step,
                (None, None) => continue,
            };
            checkpoints.push(CheckpointEntry { path, step, info });
        }

        checkpoints.sort_by(|a, b| a.step.cmp(&b.step).then_with(|| a.path.cmp(&b.path)));
        Ok(checkpoints)
    }

    /// Most recent checkpoint by step
    pub fn latest_checkpoint(&self) -> Result<Option<PathBuf>> {
        Ok(self.list_checkpoints()?.pop().map(|c| c.path))
    }

    fn parse_step(&self, stem: &str) -> Option<usize> {
        stem.strip_prefix(&format!("{}_step_", self.prefix))
            .and_then(|s| s.parse().ok())
    }

    /// Remove old step checkpoints beyond the `keep_last` limit
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        if self.keep_last == 0 {
            return Ok(());
        }

        let step_checkpoints: Vec<_> = self
            .list_checkpoints()?
            .into_iter()
            .filter(|c| {
                c.path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| self.parse_step(s))
                    .is_some()
            })
            .collect();

        if step_checkpoints.len() > self.keep_last {
            let to_remove = step_checkpoints.len() - self.keep_last;
            for checkpoint in step_checkpoints.iter().take(to_remove) {
                fs::remove_file(&checkpoint.path)?;
                let sidecar = checkpoint.path.with_extension("json");
                if sidecar.exists() {
                    fs::remove_file(sidecar)?;
                }
                tracing::debug!("Removed old checkpoint: {}", checkpoint.path.display());
            }
        }

        Ok(())
    }
}

/// Find the epoch checkpoint with the lowest epoch-average loss.
///
/// Step checkpoints record a single batch loss and are not ranked.
pub fn find_best_checkpoint(checkpoint_dir: &Path, prefix: &str) -> Result<Option<(PathBuf, f32)>> {
    if !checkpoint_dir.exists() {
        return Err(FinetuneError::checkpoint(format!(
            "checkpoint directory {} does not exist",
            checkpoint_dir.display()
        )));
    }
    let manager = CheckpointManager::new(checkpoint_dir, prefix)?;

    let mut best: Option<(PathBuf, f32)> = None;
    for checkpoint in manager.list_checkpoints()? {
        let loss = match checkpoint.info {
            Some(CheckpointInfo {
                loss: Some(loss),
                epoch: Some(_),
                ..
            }) if loss.is_finite() => loss,
            _ => continue,
        };
        if best.as_ref().map_or(true, |(_, b)| loss < *b) {
            best = Some((checkpoint.path, loss));
        }
    }

    Ok(best)
}
