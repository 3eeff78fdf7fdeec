//! Training loop, finetuning variants and checkpoint management

pub mod checkpoint;
pub mod trainer;
pub mod variant;

pub use checkpoint::{
    find_best_checkpoint,
    CheckpointEntry,
    CheckpointInfo,
    CheckpointManager,
    OptimizerState,
    RestoredState,
    TrainingHistory,
};

pub use trainer::{
    Trainer,
    TrainerConfig,
    TrainingState,
};

pub use variant::{
    FinetuneMode,
    ParamSelection,
};
