mod common;

use candle_core::Device;
use candle_nn::{Optimizer, SGD};
use csm_finetune::{
    dataset::Dataset,
    model::SpeechModel,
    training::{FinetuneMode, Trainer},
    Result,
};

use common::{quiet_trainer_config, synthetic_batch, synthetic_dataset, tiny_config, tiny_lora_config, tiny_model};

#[test]
fn test_step_counter_per_call() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = tiny_config(2);
    let mut trainer = Trainer::new(
        tiny_model(config.clone()),
        FinetuneMode::Full,
        quiet_trainer_config(dir.path()),
        &Device::Cpu,
    )?;

    let (tokens, masks) = synthetic_batch(&config, 2, 5)?;
    for expected in 1..=5 {
        let loss = trainer.train_step(&tokens, &masks)?;
        assert!(loss.is_finite());
        assert_eq!(trainer.state().step, expected);
    }
    assert_eq!(trainer.state().last_loss.map(|l| l.is_finite()), Some(true));
    Ok(())
}

#[test]
fn test_step_counter_per_epoch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = tiny_config(2);
    let dataset = synthetic_dataset(&config, 5)?;
    let mut trainer = Trainer::new(
        tiny_model(config),
        FinetuneMode::Full,
        quiet_trainer_config(dir.path()),
        &Device::Cpu,
    )?;

    // 5 samples in batches of 2: two full batches and a short one
    trainer.train(&dataset, 2, 2, true)?;
    assert_eq!(trainer.state().step, 6);
    assert!(trainer.history().is_empty());
    Ok(())
}

#[test]
fn test_history_is_recorded_every_log_interval() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = tiny_config(2);
    let dataset = synthetic_dataset(&config, 4)?;
    let mut trainer = Trainer::new(
        tiny_model(config),
        FinetuneMode::Full,
        quiet_trainer_config(dir.path()).with_intervals(0, 3),
        &Device::Cpu,
    )?;

    let history = trainer.train(&dataset, 1, 3, false)?;
    assert_eq!(trainer.state().step, 12);
    assert_eq!(history.len(), 12 / 3);
    assert_eq!(history.step, vec![3, 6, 9, 12]);
    assert_eq!(history.loss.len(), history.learning_rate.len());
    assert!(history.learning_rate.iter().all(|&lr| lr == 1e-2));

    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("history.json"))?)?;
    assert_eq!(on_disk["step"], serde_json::json!([3, 6, 9, 12]));
    Ok(())
}

#[test]
fn test_epoch_and_step_checkpoint_naming() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = tiny_lora_config(2);
    let dataset = synthetic_dataset(&config, 3)?;
    let mut trainer = Trainer::new(
        tiny_model(config),
        FinetuneMode::Lora { train_embeddings: false },
        quiet_trainer_config(dir.path()).with_intervals(2, 0),
        &Device::Cpu,
    )?;

    trainer.train(&dataset, 1, 2, false)?;
    assert_eq!(trainer.state().step, 6);

    for name in [
        "lora_ckpt_step_2.safetensors",
        "lora_ckpt_step_4.safetensors",
        "lora_ckpt_step_6.safetensors",
        "lora_ckpt_epoch_1.safetensors",
        "lora_ckpt_epoch_2.safetensors",
        "lora_ckpt_epoch_1.json",
        "optimizer_state.json",
    ] {
        assert!(dir.path().join(name).exists(), "missing {}", name);
    }
    assert!(!dir.path().join("lora_ckpt_best.safetensors").exists());

    let steps: Vec<_> = trainer
        .checkpoints()
        .list_checkpoints()?
        .into_iter()
        .map(|c| c.step)
        .collect();
    assert_eq!(steps, vec![2, 3, 4, 6, 6]);
    Ok(())
}

#[test]
fn test_shuffle_is_reproducible_for_a_seed() -> Result<()> {
    let config = tiny_config(2);
    let dataset = synthetic_dataset(&config, 6)?;
    let base = tiny_model(config.clone());
    let weights_dir = tempfile::tempdir()?;

    // Save one initialisation and load it into both runs
    let seed_trainer = Trainer::new(
        base,
        FinetuneMode::Full,
        quiet_trainer_config(weights_dir.path()),
        &Device::Cpu,
    )?;
    let init = seed_trainer.save_checkpoint(Some("init"))?;

    let mut losses = Vec::new();
    for _ in 0..2 {
        let dir = tempfile::tempdir()?;
        let mut trainer = Trainer::new(
            tiny_model(config.clone()),
            FinetuneMode::Full,
            quiet_trainer_config(dir.path()).with_intervals(0, 1).with_seed(7),
            &Device::Cpu,
        )?;
        trainer.model_mut().load_weights(&init)?;
        losses.push(trainer.train(&dataset, 2, 2, true)?.loss);
    }
    assert_eq!(losses[0], losses[1]);
    Ok(())
}

#[test]
fn test_custom_optimizer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = tiny_lora_config(3);
    let mut trainer = Trainer::with_optimizer(
        tiny_model(config.clone()),
        FinetuneMode::Lora { train_embeddings: true },
        quiet_trainer_config(dir.path()),
        &Device::Cpu,
        |vars| SGD::new(vars, 0.05),
    )?;
    assert_eq!(trainer.learning_rate(), 0.05);
    assert_eq!(trainer.selection().trainable().len(), 4 + 2);

    let dataset = synthetic_dataset(&config, 2)?;
    assert_eq!(dataset.len(), 2);
    let history = trainer.train(&dataset, 2, 1, false)?;
    assert!(history.is_empty());
    assert_eq!(trainer.state().step, 1);
    assert_eq!(trainer.optimizer().learning_rate(), 0.05);
    Ok(())
}
