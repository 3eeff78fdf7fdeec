//! csm-finetune binary.
//!
//! Finetunes the reference speech model on a pre-tokenized dataset, either
//! fully or through low-rank adapters.

use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use clap::Parser;
use csm_finetune::{
    config::{Args, FinetuneConfig},
    dataset::InMemoryDataset,
    model::SpeechModel,
    reference::ReferenceModel,
    training::Trainer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("csm_finetune=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = FinetuneConfig::load(&args)?;

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    info!("Using device {:?}", device);

    let mode = config.finetune_mode()?;
    let mut model = ReferenceModel::new(config.reference_config()?, &device)?;
    if let Some(path) = &config.model.base_weights {
        model
            .load_weights(path)
            .with_context(|| format!("loading base weights from {}", path.display()))?;
        info!("Loaded base weights from {}", path.display());
    }

    let data_path = config
        .data
        .path
        .as_ref()
        .ok_or_else(|| anyhow!("no dataset given, pass --data or set [data].path"))?;
    let dataset = InMemoryDataset::from_safetensors(data_path, &device)
        .with_context(|| format!("loading dataset from {}", data_path.display()))?;

    let mut trainer = Trainer::new(model, mode, config.trainer_config(), &device)?;

    let resume = match &args.resume {
        Some(path) => Some(path.clone()),
        None if args.resume_latest => trainer.checkpoints().latest_checkpoint()?,
        None => None,
    };
    if let Some(path) = resume {
        trainer
            .load_checkpoint(&path)
            .with_context(|| format!("resuming from {}", path.display()))?;
    }

    info!(
        "Starting {:?} finetuning for {} epochs (batch size {})",
        mode, config.training.epochs, config.training.batch_size
    );
    let history = trainer.train(
        &dataset,
        config.training.batch_size,
        config.training.epochs,
        config.training.shuffle,
    )?;

    println!("Finished at step {}", trainer.state().step);
    println!("Recorded {} history entries", history.len());
    if let Some(best) = trainer.state().best_loss {
        println!("Best epoch loss: {:.4}", best);
    }

    Ok(())
}
