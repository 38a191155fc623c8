//! End-to-end run: data, tokenization, model, training, save, merge.

use std::error::Error as _;
use std::path::PathBuf;

use crate::config::TuneConfig;
use crate::dataset::DatasetSplits;
use crate::error::{Result, TuneError};
use crate::merge::merge_adapter;
use crate::model::{load_model_from_dir, load_tokenizer, resolve_model_path, save_tokenizer, select_device};
use crate::prompt::{tokenize_records, PromptTemplate};
use crate::trainer::{latest_checkpoint, TrainOutput, Trainer};

/// `resume_from_checkpoint` value selecting the newest checkpoint in `output_dir`.
pub const RESUME_LATEST: &str = "latest";

const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "CUDA_ERROR_OUT_OF_MEMORY",
    "OutOfMemory",
];

/// Run the whole fine-tuning pipeline.
///
/// Returns `Ok(None)` when training itself failed; the failure has already
/// been logged and nothing is saved or merged.
///
/// # Errors
///
/// Returns an error for problems before training starts (invalid config,
/// empty datasets, missing model files) or while saving and merging.
pub fn run(config: &TuneConfig) -> Result<Option<TrainOutput>> {
    config.validate()?;

    let device = select_device();
    // Adapter init draws from `config.seed` at load time; this covers
    // dropout masks, which candle cannot seed on CPU.
    if !device.is_cpu() {
        if let Err(err) = device.set_seed(config.seed) {
            tracing::warn!("Device RNG not seeded: {err}");
        }
    }

    let splits = DatasetSplits::load(&config.dataset)?;
    tracing::info!(
        "Dataset sizes - Train: {}, Val: {}, Test: {}",
        splits.train.len(),
        splits.validation.len(),
        splits.test.len()
    );

    let model_path = resolve_model_path(&config.base_model)?;
    let tokenizer = load_tokenizer(&model_path)?;
    let template = PromptTemplate::from(&config.prompt);
    let max_length = config.dataset.max_length;
    let train = tokenize_records(&tokenizer, &template, &splits.train, max_length, "train")?;
    let validation = tokenize_records(&tokenizer, &template, &splits.validation, max_length, "validation")?;
    if train.is_empty() || validation.is_empty() {
        return Err(TuneError::Dataset(
            "no examples left after tokenization; increase dataset.max_length".into(),
        ));
    }

    let model = load_model_from_dir(config, &model_path, &device)?;
    let mut trainer = Trainer::new(config.clone(), model, train, validation, tokenizer.pad_token_id)?;

    let Some(output) = start_training(&mut trainer) else {
        tracing::error!("Training failed, model not saved");
        return Ok(None);
    };

    tracing::info!("Saving final model...");
    trainer.save_model(&config.output_dir)?;
    save_tokenizer(&tokenizer, &config.output_dir)?;
    tracing::info!("Model + tokenizer saved at {}", config.output_dir);

    drop(trainer);

    tracing::info!("Merging LoRA weights...");
    merge_adapter(&config.base_model, &config.output_dir, &config.merged_dir, &tokenizer)?;
    tracing::info!("Fully merged model saved to: {}", config.merged_dir);

    Ok(Some(output))
}

/// Resume if configured, then train.
///
/// Failures are logged and turned into `None`: out-of-memory errors with
/// advice on batch size and sequence length, anything else with its full
/// cause chain.
pub fn start_training(trainer: &mut Trainer) -> Option<TrainOutput> {
    let config = trainer.config().clone();
    let training = &config.training;
    tracing::info!("Model: {}", config.base_model);
    tracing::info!(
        "Train batch size: {}, eval batch size: {}, gradient accumulation: {}, effective batch size: {}",
        training.train_batch_size,
        training.eval_batch_size,
        training.gradient_accumulation_steps,
        training.effective_batch_size()
    );
    tracing::info!(
        "Max sequence length: {}, learning rate: {}, epochs: {}",
        config.dataset.max_length,
        training.learning_rate,
        training.epochs
    );
    tracing::info!(
        "LoRA rank: {}, alpha: {}, dropout: {}",
        config.lora.r,
        config.lora.alpha,
        config.lora.dropout
    );

    let result = resume_checkpoint(&config).and_then(|checkpoint| {
        if let Some(dir) = checkpoint {
            trainer.resume_from(dir)?;
        }
        trainer.train()
    });
    report_training_result(result, &config)
}

/// Log the outcome of a training run and keep only a success.
fn report_training_result(result: Result<TrainOutput>, config: &TuneConfig) -> Option<TrainOutput> {
    match result {
        Ok(output) => {
            tracing::info!("Training completed successfully");
            tracing::info!("Final training loss: {:.4}", output.training_loss);
            tracing::info!("Training time: {:.2} seconds", output.training_time.as_secs_f64());
            Some(output)
        }
        Err(err) if is_out_of_memory(&err) => {
            tracing::error!("Out of memory: {err}");
            tracing::error!("Try reducing batch size or sequence length");
            tracing::error!(
                "Current: train_batch_size={}, max_length={}",
                config.training.train_batch_size,
                config.dataset.max_length
            );
            tracing::error!("Suggested: train_batch_size=1, gradient_accumulation_steps=8");
            None
        }
        Err(err) => {
            tracing::error!("Training error: {}", error_chain(&err));
            None
        }
    }
}

/// Whether `err`, or any error in its source chain, reports memory exhaustion.
#[must_use]
pub fn is_out_of_memory(err: &TuneError) -> bool {
    let mut current: Option<&dyn std::error::Error> = Some(err);
    while let Some(e) = current {
        let text = e.to_string();
        if OOM_MARKERS.iter().any(|m| text.contains(m)) {
            return true;
        }
        current = e.source();
    }
    false
}

fn error_chain(err: &TuneError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(&format!("\n  caused by: {cause}"));
        source = cause.source();
    }
    out
}

/// Checkpoint directory to resume from, if `resume_from_checkpoint` is set.
fn resume_checkpoint(config: &TuneConfig) -> Result<Option<PathBuf>> {
    match config.training.resume_from_checkpoint.as_deref() {
        None => Ok(None),
        Some(RESUME_LATEST) => {
            let latest = latest_checkpoint(&config.output_dir)?;
            if latest.is_none() {
                tracing::warn!(
                    "No checkpoint found in {}; starting from scratch",
                    config.output_dir
                );
            }
            Ok(latest)
        }
        Some(path) => Ok(Some(PathBuf::from(path))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_out_of_memory_detection() {
        let oom = TuneError::Candle(candle_core::Error::Msg(
            "DriverError(CUDA_ERROR_OUT_OF_MEMORY, \"out of memory\")".into(),
        ));
        assert!(is_out_of_memory(&oom));

        let other = TuneError::Training("gradient norm is NaN".into());
        assert!(!is_out_of_memory(&other));
    }

    #[test]
    fn test_out_of_memory_in_source_chain() {
        let cuda = candle_core::Error::Msg("DriverError(CUDA_ERROR_OUT_OF_MEMORY)".into());
        let io = std::io::Error::other(cuda);
        assert!(is_out_of_memory(&TuneError::Io(io)));

        let io = std::io::Error::other("memory allocation of 1024 bytes failed");
        assert!(!is_out_of_memory(&TuneError::Io(io)));
    }

    #[test]
    fn test_failed_training_reports_none() {
        let config = TuneConfig::from_preset("stablelm-3b").unwrap();

        let oom = TuneError::Candle(candle_core::Error::Msg(
            "DriverError(CUDA_ERROR_OUT_OF_MEMORY, \"out of memory\")".into(),
        ));
        assert!(report_training_result(Err(oom), &config).is_none());

        let other = TuneError::Training("loss is NaN at step 12".into());
        assert!(report_training_result(Err(other), &config).is_none());
    }

    #[test]
    fn test_error_chain_includes_message() {
        let err = TuneError::Checkpoint("checkpoint-450 missing".into());
        assert!(error_chain(&err).contains("checkpoint-450 missing"));
    }

    #[test]
    fn test_resume_latest() {
        let dir = TempDir::new().unwrap();
        let mut config = TuneConfig::from_preset("stablelm-3b").unwrap();
        config.output_dir = dir.path().to_string_lossy().into_owned();

        config.training.resume_from_checkpoint = Some(RESUME_LATEST.into());
        assert_eq!(resume_checkpoint(&config).unwrap(), None);

        for step in [150, 300] {
            std::fs::create_dir_all(dir.path().join(format!("checkpoint-{step}"))).unwrap();
        }
        assert_eq!(
            resume_checkpoint(&config).unwrap(),
            Some(dir.path().join("checkpoint-300"))
        );

        config.training.resume_from_checkpoint = Some("/ckpt/checkpoint-450".into());
        assert_eq!(
            resume_checkpoint(&config).unwrap(),
            Some(PathBuf::from("/ckpt/checkpoint-450"))
        );
    }

    #[test]
    fn test_run_with_empty_dataset_is_error() {
        let dir = TempDir::new().unwrap();
        let mut config = TuneConfig::from_preset("stablelm-3b").unwrap();
        config.dataset = crate::config::DatasetConfig::in_dir(dir.path().to_str().unwrap());
        assert!(matches!(run(&config), Err(TuneError::Dataset(_))));
    }
}
