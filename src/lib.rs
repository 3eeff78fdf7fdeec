//! Finetuning for backbone/decoder speech models over residual audio codebooks.
//!
//! The crate provides the masked, codebook-weighted training loss
//! ([`loss::compute_loss`]), a [`training::Trainer`] running full or LoRA
//! finetuning, and checkpoint bookkeeping. Models plug in through
//! [`model::SpeechModel`]; [`reference::ReferenceModel`] is a small
//! implementation used by the binary, tests and benches.

pub mod config;
pub mod dataset;
pub mod error;
pub mod lora;
pub mod loss;
pub mod model;
pub mod params;
pub mod reference;
pub mod training;

// Re-export commonly used types
pub use dataset::{Dataset, InMemoryDataset};
pub use error::{FinetuneError, Result};
pub use loss::compute_loss;
pub use model::SpeechModel;
pub use params::{FlatParams, ParamTree};
pub use training::{CheckpointManager, FinetuneMode, Trainer, TrainerConfig, TrainingHistory};
