//! Training loop and optimization.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::adapters::{load_adapter, save_adapter, AdapterConfig};
use crate::collator::{batch_indices, collate, shuffled_indices, Batch, LengthGroupedSampler};
use crate::config::TuneConfig;
use crate::error::{Result, TuneError};
use crate::model::{causal_lm_loss, LoadedModel};
use crate::optimizer::{AdamWOptimizer, OptimizerConfig};
use crate::prompt::TokenizedExample;
use crate::scheduler::LRScheduler;

/// Trainer state file inside a checkpoint directory.
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
/// Run configuration snapshot inside a checkpoint directory.
pub const CONFIG_SNAPSHOT_FILE: &str = "config.yaml";
/// JSONL log written under `logs_dir`.
pub const TRAIN_LOG_FILE: &str = "train_log.jsonl";

const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// One entry of the training log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Optimizer step.
    pub step: usize,
    /// Fractional epoch.
    pub epoch: f64,
    /// Mean training loss since the previous log entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    /// Validation loss.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
    /// Learning rate used by the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    /// Gradient norm before clipping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
}

/// Progress persisted with every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Completed optimizer steps.
    pub global_step: usize,
    /// Fractional epoch.
    pub epoch: f64,
    /// Planned optimizer steps.
    pub max_steps: usize,
    /// Learning rate of the last step.
    pub learning_rate: f64,
    /// Lowest validation loss seen.
    pub best_metric: Option<f64>,
    /// Checkpoint holding the adapter with `best_metric`.
    pub best_model_checkpoint: Option<String>,
    /// Evaluations since the last improvement.
    pub early_stopping_counter: usize,
    /// Logged metrics.
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    /// Read `trainer_state.json` from a checkpoint directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(TRAINER_STATE_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            TuneError::Checkpoint(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write `trainer_state.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        std::fs::write(
            dir.as_ref().join(TRAINER_STATE_FILE),
            serde_json::to_string_pretty(self)?,
        )?;
        Ok(())
    }
}

/// Summary returned by [`Trainer::train`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    /// Optimizer steps completed, including resumed ones.
    pub global_step: usize,
    /// Mean training loss over the steps run by this call.
    pub training_loss: f64,
    /// Wall-clock time of this call.
    pub training_time: Duration,
    /// Best checkpoint by validation loss, if any was saved.
    pub best_model_checkpoint: Option<PathBuf>,
    /// Whether early stopping ended the run.
    pub stopped_early: bool,
}

/// Training orchestrator.
pub struct Trainer {
    config: TuneConfig,
    model: LoadedModel,
    train_examples: Vec<TokenizedExample>,
    eval_examples: Vec<TokenizedExample>,
    pad_token_id: u32,
    device: Device,
    optimizer: AdamWOptimizer,
    scheduler: LRScheduler,
    state: TrainerState,
    batches_per_epoch: usize,
    steps_per_epoch: usize,
    improved_at_last_eval: bool,
}

impl Trainer {
    /// Create a new trainer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the model has no
    /// trainable parameters, or the training set is smaller than one batch.
    pub fn new(
        config: TuneConfig,
        model: LoadedModel,
        train_examples: Vec<TokenizedExample>,
        eval_examples: Vec<TokenizedExample>,
        pad_token_id: u32,
    ) -> Result<Self> {
        config.validate()?;
        let training = &config.training;

        let batches_per_epoch = if training.dataloader_drop_last {
            train_examples.len() / training.train_batch_size
        } else {
            train_examples.len().div_ceil(training.train_batch_size)
        };
        if batches_per_epoch == 0 {
            return Err(TuneError::Training(format!(
                "{} training examples do not fill one batch of {}",
                train_examples.len(),
                training.train_batch_size
            )));
        }
        let steps_per_epoch = batches_per_epoch.div_ceil(training.gradient_accumulation_steps);
        let max_steps = steps_per_epoch * training.epochs;

        let optimizer = AdamWOptimizer::new(model.varmap.all_vars(), OptimizerConfig::from(training))?;
        let scheduler = LRScheduler::from_training(training, max_steps);
        let device = model.model.device().clone();

        Ok(Self {
            state: TrainerState {
                max_steps,
                learning_rate: scheduler.current_lr(),
                ..Default::default()
            },
            config,
            model,
            train_examples,
            eval_examples,
            pad_token_id,
            device,
            optimizer,
            scheduler,
            batches_per_epoch,
            steps_per_epoch,
            improved_at_last_eval: false,
        })
    }

    /// Resume from a checkpoint directory written by this trainer.
    ///
    /// Restores the adapter weights and [`TrainerState`]; already completed
    /// optimizer steps are skipped by [`Trainer::train`]. Optimizer moments
    /// start from zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be loaded.
    pub fn resume_from<P: AsRef<Path>>(&mut self, checkpoint: P) -> Result<()> {
        let dir = checkpoint.as_ref();
        if !dir.is_dir() {
            return Err(TuneError::Checkpoint(format!(
                "checkpoint not found: {}",
                dir.display()
            )));
        }

        load_adapter(&self.model.varmap, dir, &self.device)?;
        let mut state = TrainerState::load(dir)?;
        state.max_steps = self.state.max_steps;
        self.scheduler.set_step(state.global_step);
        self.state = state;
        self.optimizer.zero_grad();

        tracing::info!(
            "Resumed from {} at step {} (epoch {:.2})",
            dir.display(),
            self.state.global_step,
            self.state.epoch
        );
        Ok(())
    }

    /// Run the training loop.
    ///
    /// # Errors
    ///
    /// Returns an error if a forward/backward pass, evaluation or checkpoint
    /// write fails.
    pub fn train(&mut self) -> Result<TrainOutput> {
        let start = Instant::now();
        let training = self.config.training.clone();

        tracing::info!("Starting training");
        tracing::info!("  Base model: {}", self.config.base_model);
        tracing::info!("  Adapter: {:?}", self.config.adapter);
        tracing::info!("  Num examples: {}", self.train_examples.len());
        tracing::info!("  Num epochs: {}", training.epochs);
        tracing::info!(
            "  Batch size: {} x {} accumulation = {}",
            training.train_batch_size,
            training.gradient_accumulation_steps,
            training.effective_batch_size()
        );
        tracing::info!("  Total optimization steps: {}", self.state.max_steps);
        tracing::info!("  Warmup steps: {}", self.scheduler.warmup_steps());

        std::fs::create_dir_all(&self.config.output_dir)?;
        std::fs::create_dir_all(&self.config.logs_dir)?;

        let pb = ProgressBar::new(self.state.max_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )?
                .progress_chars("#>-"),
        );
        pb.set_position(self.state.global_step as u64);

        let start_step = self.state.global_step;
        let start_epoch = start_step / self.steps_per_epoch;
        let mut skip_micro_batches =
            (start_step % self.steps_per_epoch) * training.gradient_accumulation_steps;

        let mut total_loss = 0.0;
        let mut logging_loss = 0.0;
        let mut logging_steps = 0usize;
        let mut step_loss = 0.0;
        let mut step_micro_batches = 0usize;
        let mut stopped_early = false;

        'epochs: for epoch in start_epoch..training.epochs {
            let batches = self.epoch_batches(epoch);
            tracing::info!("Starting epoch {}/{}", epoch + 1, training.epochs);

            for (i, indices) in batches.iter().enumerate() {
                if skip_micro_batches > 0 {
                    skip_micro_batches -= 1;
                    continue;
                }

                let batch = self.collate_indices(&self.train_examples, indices)?;
                let logits = self
                    .model
                    .model
                    .forward(&batch.input_ids, Some(&batch.attention_mask), true)?;
                let loss = causal_lm_loss(&logits, &batch.labels)?;
                step_loss += f64::from(loss.to_scalar::<f32>()?);
                step_micro_batches += 1;
                self.optimizer.accumulate(&loss)?;

                let end_of_epoch = i + 1 == batches.len();
                if !self.optimizer.ready() && !end_of_epoch {
                    continue;
                }

                let lr = self.scheduler.current_lr();
                self.optimizer.set_learning_rate(lr);
                let grad_norm = self.optimizer.step()?;
                self.scheduler.step();

                let loss = step_loss / step_micro_batches as f64;
                step_loss = 0.0;
                step_micro_batches = 0;

                self.state.global_step += 1;
                self.state.epoch = epoch as f64 + (i + 1) as f64 / batches.len() as f64;
                self.state.learning_rate = lr;
                total_loss += loss;
                logging_loss += loss;
                logging_steps += 1;

                pb.inc(1);
                pb.set_message(format!("loss {loss:.4}"));

                let step = self.state.global_step;
                if step % training.logging_steps == 0 {
                    self.log(LogEntry {
                        step,
                        epoch: self.state.epoch,
                        loss: Some(logging_loss / logging_steps as f64),
                        learning_rate: Some(lr),
                        grad_norm: Some(grad_norm),
                        ..Default::default()
                    })?;
                    logging_loss = 0.0;
                    logging_steps = 0;
                }

                if step % training.eval_steps == 0 {
                    let eval_loss = self.evaluate()?;
                    self.log(LogEntry {
                        step,
                        epoch: self.state.epoch,
                        eval_loss: Some(eval_loss),
                        ..Default::default()
                    })?;
                    self.track_best(eval_loss);
                }

                if step % training.save_steps == 0 {
                    self.save_checkpoint()?;
                }

                if training.early_stopping_patience > 0
                    && self.state.early_stopping_counter >= training.early_stopping_patience
                {
                    tracing::info!(
                        "Early stopping: no eval_loss improvement in {} evaluations",
                        self.state.early_stopping_counter
                    );
                    stopped_early = true;
                    break 'epochs;
                }
            }
        }

        pb.finish_with_message("Training complete");

        if training.load_best_model_at_end {
            if let Some(best) = self.state.best_model_checkpoint.clone() {
                tracing::info!(
                    "Loading best model from {best} (eval_loss {:.4})",
                    self.state.best_metric.unwrap_or(f64::NAN)
                );
                load_adapter(&self.model.varmap, &best, &self.device)?;
            }
        }

        let steps_run = self.state.global_step - start_step;
        let output = TrainOutput {
            global_step: self.state.global_step,
            training_loss: total_loss / steps_run.max(1) as f64,
            training_time: start.elapsed(),
            best_model_checkpoint: self.state.best_model_checkpoint.as_ref().map(PathBuf::from),
            stopped_early,
        };
        tracing::info!(
            "Training finished: {} steps, train_loss={:.4}, {:.1}s",
            output.global_step,
            output.training_loss,
            output.training_time.as_secs_f64()
        );
        Ok(output)
    }

    /// Mean loss over the validation set, weighted by batch size.
    ///
    /// # Errors
    ///
    /// Returns an error if the validation set is empty or a forward pass fails.
    pub fn evaluate(&self) -> Result<f64> {
        if self.eval_examples.is_empty() {
            return Err(TuneError::Training("validation set is empty".into()));
        }

        let order: Vec<usize> = (0..self.eval_examples.len()).collect();
        let mut weighted = 0.0;
        let mut count = 0usize;
        for indices in batch_indices(&order, self.config.training.eval_batch_size, false) {
            let batch = self.collate_indices(&self.eval_examples, &indices)?;
            let logits = self
                .model
                .model
                .forward(&batch.input_ids, Some(&batch.attention_mask), false)?;
            let loss = causal_lm_loss(&logits, &batch.labels)?.to_scalar::<f32>()?;
            weighted += f64::from(loss) * indices.len() as f64;
            count += indices.len();
        }

        let eval_loss = weighted / count as f64;
        tracing::info!("Step {}: eval_loss={eval_loss:.4}", self.state.global_step);
        Ok(eval_loss)
    }

    /// Write the adapter weights and `adapter_config.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn save_model<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let adapter_config = AdapterConfig::new(&self.config.base_model, &self.config.lora);
        save_adapter(&self.model.varmap, &adapter_config, dir.as_ref())?;
        tracing::info!("Saved adapter to {}", dir.as_ref().display());
        Ok(())
    }

    /// Progress so far.
    #[must_use]
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Optimizer steps per epoch.
    #[must_use]
    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    /// Micro-batches per epoch.
    #[must_use]
    pub fn batches_per_epoch(&self) -> usize {
        self.batches_per_epoch
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &TuneConfig {
        &self.config
    }

    /// The model being trained.
    #[must_use]
    pub fn model(&self) -> &LoadedModel {
        &self.model
    }

    fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let training = &self.config.training;
        let order = if training.group_by_length {
            LengthGroupedSampler::from_examples(
                &self.train_examples,
                training.train_batch_size,
                self.config.seed,
            )
            .indices(epoch)
        } else {
            shuffled_indices(self.train_examples.len(), self.config.seed, epoch)
        };
        batch_indices(&order, training.train_batch_size, training.dataloader_drop_last)
    }

    fn collate_indices(&self, examples: &[TokenizedExample], indices: &[usize]) -> Result<Batch> {
        let selected: Vec<&TokenizedExample> = indices.iter().map(|&i| &examples[i]).collect();
        collate(&selected, self.pad_token_id, &self.device)
    }

    fn track_best(&mut self, eval_loss: f64) {
        let improved = self.state.best_metric.map_or(true, |best| eval_loss < best);
        if improved {
            self.state.best_metric = Some(eval_loss);
            self.state.early_stopping_counter = 0;
        } else {
            self.state.early_stopping_counter += 1;
        }
        self.improved_at_last_eval = improved;
    }

    fn log(&mut self, entry: LogEntry) -> Result<()> {
        match (entry.loss, entry.eval_loss) {
            (Some(loss), _) => tracing::info!(
                "Step {}: loss={loss:.4}, lr={:.2e}, grad_norm={:.4}, epoch={:.2}",
                entry.step,
                entry.learning_rate.unwrap_or_default(),
                entry.grad_norm.unwrap_or_default(),
                entry.epoch
            ),
            (None, Some(eval_loss)) => {
                tracing::debug!("Step {}: logged eval_loss={eval_loss:.4}", entry.step);
            }
            (None, None) => {}
        }

        let path = Path::new(&self.config.logs_dir).join(TRAIN_LOG_FILE);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;

        self.state.log_history.push(entry);
        Ok(())
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        let dir = Path::new(&self.config.output_dir)
            .join(format!("{CHECKPOINT_PREFIX}{}", self.state.global_step));
        std::fs::create_dir_all(&dir)?;

        if self.improved_at_last_eval {
            self.state.best_model_checkpoint = Some(dir.to_string_lossy().into_owned());
            self.improved_at_last_eval = false;
        }

        self.save_model(&dir)?;
        self.state.save(&dir)?;
        self.config.to_file(dir.join(CONFIG_SNAPSHOT_FILE))?;
        tracing::info!("Saved checkpoint to: {}", dir.display());

        self.rotate_checkpoints()
    }

    /// Delete the oldest checkpoints beyond `save_total_limit`, never the best.
    fn rotate_checkpoints(&self) -> Result<()> {
        let limit = self.config.training.save_total_limit;
        if limit == 0 {
            return Ok(());
        }
        let mut checkpoints = sorted_checkpoints(&self.config.output_dir)?;
        let best = self
            .state
            .best_model_checkpoint
            .as_ref()
            .map(PathBuf::from);

        // Keep the best one just before the newest so it survives deletion.
        let mut limit = limit;
        if let Some(best_idx) = best
            .as_ref()
            .and_then(|b| checkpoints.iter().position(|c| c == b))
        {
            let last = checkpoints.len() - 1;
            if limit == 1 && best_idx != last {
                limit = 2;
            }
            if best_idx + 1 < last {
                let best = checkpoints.remove(best_idx);
                checkpoints.insert(last - 1, best);
            }
        }

        let excess = checkpoints.len().saturating_sub(limit);
        for dir in checkpoints.into_iter().take(excess) {
            tracing::info!(
                "Deleting older checkpoint [{}] due to save_total_limit",
                dir.display()
            );
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// `checkpoint-{step}` directories under `output_dir`, oldest first.
///
/// # Errors
///
/// Returns an error if `output_dir` cannot be read.
pub fn sorted_checkpoints<P: AsRef<Path>>(output_dir: P) -> Result<Vec<PathBuf>> {
    let dir = output_dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found: Vec<(usize, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .filter_map(|p| {
            let step = p
                .file_name()?
                .to_str()?
                .strip_prefix(CHECKPOINT_PREFIX)?
                .parse()
                .ok()?;
            Some((step, p))
        })
        .collect();
    found.sort_by_key(|(step, _)| *step);
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

/// Newest checkpoint under `output_dir`.
///
/// # Errors
///
/// Returns an error if `output_dir` cannot be read.
pub fn latest_checkpoint<P: AsRef<Path>>(output_dir: P) -> Result<Option<PathBuf>> {
    Ok(sorted_checkpoints(output_dir)?.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterType;
    use crate::model::load_model_from_dir;
    use crate::model::testing::write_tiny_model;
    use crate::prompt::IGNORE_INDEX;
    use std::fs;
    use tempfile::TempDir;

    /// Helper to create a minimal valid config for testing
    fn create_test_config(root: &Path) -> TuneConfig {
        let mut config = TuneConfig::from_preset("tinyllama-1.1b").unwrap();
        config.base_model = root.join("model").to_string_lossy().into_owned();
        config.adapter = AdapterType::Lora;
        config.quantization = None;
        config.lora.r = 4;
        config.lora.alpha = 8;
        config.lora.dropout = 0.0;
        config.output_dir = root.join("outputs").to_string_lossy().into_owned();
        config.logs_dir = root.join("logs").to_string_lossy().into_owned();

        let t = &mut config.training;
        t.epochs = 1;
        t.train_batch_size = 2;
        t.eval_batch_size = 2;
        t.gradient_accumulation_steps = 1;
        t.learning_rate = 1e-2;
        t.warmup_steps = 0;
        t.warmup_ratio = 0.0;
        t.logging_steps = 1;
        t.eval_steps = 1000;
        t.save_steps = 1000;
        t.early_stopping_patience = 0;
        t.load_best_model_at_end = false;
        t.group_by_length = false;
        t.dataloader_drop_last = true;
        config
    }

    /// Helper to create examples whose response repeats one token
    fn create_examples(count: usize) -> Vec<TokenizedExample> {
        (0..count)
            .map(|i| {
                let len = 4 + i % 3;
                let input_ids: Vec<u32> = (0..len).map(|j| if j < 2 { 2 + j as u32 } else { 11 }).collect();
                let labels = input_ids
                    .iter()
                    .enumerate()
                    .map(|(j, &id)| if j < 2 { IGNORE_INDEX } else { i64::from(id) })
                    .collect();
                TokenizedExample {
                    attention_mask: vec![1; len],
                    input_ids,
                    labels,
                }
            })
            .collect()
    }

    fn create_trainer(root: &Path, config: TuneConfig, num_train: usize) -> Trainer {
        let model_dir = root.join("model");
        fs::create_dir_all(&model_dir).unwrap();
        if !model_dir.join("config.json").exists() {
            write_tiny_model(&model_dir);
        }
        let model = load_model_from_dir(&config, &model_dir, &Device::Cpu).unwrap();
        Trainer::new(config, model, create_examples(num_train), create_examples(4), 1).unwrap()
    }

    // ========================================================================
    // Tests for Trainer::new
    // ========================================================================

    #[test]
    fn test_trainer_step_counts() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.training.epochs = 3;
        config.training.gradient_accumulation_steps = 2;

        // 7 examples, batch 2, drop_last: 3 batches; 2 steps per epoch
        let trainer = create_trainer(temp_dir.path(), config, 7);
        assert_eq!(trainer.batches_per_epoch(), 3);
        assert_eq!(trainer.steps_per_epoch(), 2);
        assert_eq!(trainer.state().max_steps, 6);
        assert_eq!(trainer.state().global_step, 0);
    }

    #[test]
    fn test_trainer_new_with_too_few_examples() {
        let temp_dir = TempDir::new().unwrap();
        let model_dir = temp_dir.path().join("model");
        fs::create_dir_all(&model_dir).unwrap();
        write_tiny_model(&model_dir);

        let config = create_test_config(temp_dir.path());
        let model = load_model_from_dir(&config, &model_dir, &Device::Cpu).unwrap();
        let result = Trainer::new(config, model, create_examples(1), create_examples(2), 1);
        assert!(matches!(result, Err(TuneError::Training(_))));
    }

    #[test]
    fn test_trainer_new_with_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let model_dir = temp_dir.path().join("model");
        fs::create_dir_all(&model_dir).unwrap();
        write_tiny_model(&model_dir);

        let mut config = create_test_config(temp_dir.path());
        let model = load_model_from_dir(&config, &model_dir, &Device::Cpu).unwrap();
        config.base_model = String::new();
        assert!(Trainer::new(config, model, create_examples(4), create_examples(2), 1).is_err());
    }

    // ========================================================================
    // Tests for train
    // ========================================================================

    #[test]
    fn test_train_reduces_loss_and_logs() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.training.epochs = 4;
        let mut trainer = create_trainer(temp_dir.path(), config, 8);

        let before = trainer.evaluate().unwrap();
        let output = trainer.train().unwrap();
        let after = trainer.evaluate().unwrap();

        assert_eq!(output.global_step, 16);
        assert!(output.training_loss.is_finite());
        assert!(after < before, "eval loss {before} -> {after}");

        let log = fs::read_to_string(temp_dir.path().join("logs").join(TRAIN_LOG_FILE)).unwrap();
        assert_eq!(log.lines().count(), 16);
        let first: LogEntry = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(first.step, 1);
        assert!(first.grad_norm.is_some());
    }

    #[test]
    fn test_gradient_accumulation_steps() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.training.epochs = 2;
        config.training.gradient_accumulation_steps = 3;

        // 10 examples, batch 2: 5 micro-batches; steps after 3 and at epoch end
        let mut trainer = create_trainer(temp_dir.path(), config, 10);
        let output = trainer.train().unwrap();
        assert_eq!(output.global_step, 4);
    }

    #[test]
    fn test_group_by_length_training() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.training.group_by_length = true;
        config.training.dataloader_drop_last = false;

        let mut trainer = create_trainer(temp_dir.path(), config, 5);
        let output = trainer.train().unwrap();
        assert_eq!(output.global_step, 3);
    }

    // ========================================================================
    // Tests for checkpoint operations
    // ========================================================================

    #[test]
    fn test_checkpoint_contents() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.training.save_steps = 2;
        config.training.eval_steps = 2;
        config.training.save_total_limit = 0;

        let mut trainer = create_trainer(temp_dir.path(), config, 8);
        trainer.train().unwrap();

        let checkpoint = temp_dir.path().join("outputs").join("checkpoint-2");
        for file in [
            crate::adapters::ADAPTER_WEIGHTS_FILE,
            crate::adapters::ADAPTER_CONFIG_FILE,
            TRAINER_STATE_FILE,
            CONFIG_SNAPSHOT_FILE,
        ] {
            assert!(checkpoint.join(file).exists(), "missing {file}");
        }

        let state = TrainerState::load(&checkpoint).unwrap();
        assert_eq!(state.global_step, 2);
        assert!(state.log_history.iter().any(|e| e.eval_loss.is_some()));
        assert_eq!(sorted_checkpoints(temp_dir.path().join("outputs")).unwrap().len(), 2);
    }

    #[test]
    fn test_checkpoint_rotation_keeps_best() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.training.epochs = 3;
        config.training.save_steps = 1;
        config.training.eval_steps = 1;
        config.training.save_total_limit = 2;

        let mut trainer = create_trainer(temp_dir.path(), config, 4);
        let output = trainer.train().unwrap();

        let remaining = sorted_checkpoints(temp_dir.path().join("outputs")).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(
            remaining.last().unwrap().file_name().unwrap(),
            format!("checkpoint-{}", output.global_step).as_str()
        );
        let best = output.best_model_checkpoint.unwrap();
        assert!(remaining.contains(&best));
    }

    #[test]
    fn test_early_stopping() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.training.epochs = 50;
        config.training.eval_steps = 1;
        config.training.save_steps = 1;
        config.training.early_stopping_patience = 1;
        // a negligible learning rate never improves after the first evaluation
        config.training.learning_rate = 1e-12;

        let mut trainer = create_trainer(temp_dir.path(), config, 4);
        let output = trainer.train().unwrap();
        assert!(output.stopped_early);
        assert!(output.global_step < 100);
    }

    #[test]
    fn test_load_best_model_at_end() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.training.epochs = 2;
        config.training.eval_steps = 2;
        config.training.save_steps = 2;
        config.training.load_best_model_at_end = true;

        let mut trainer = create_trainer(temp_dir.path(), config, 4);
        let output = trainer.train().unwrap();

        let best = trainer.state().best_metric.unwrap();
        let reloaded = trainer.evaluate().unwrap();
        assert!((best - reloaded).abs() < 1e-4);
        assert!(output.best_model_checkpoint.is_some());
    }

    // ========================================================================
    // Tests for resume_from
    // ========================================================================

    #[test]
    fn test_resume_from_missing_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(temp_dir.path());
        let mut trainer = create_trainer(temp_dir.path(), config, 4);

        let result = trainer.resume_from(temp_dir.path().join("checkpoint-100"));
        assert!(matches!(result, Err(TuneError::Checkpoint(_))));
    }

    #[test]
    fn test_resume_skips_completed_steps() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.training.epochs = 2;
        config.training.save_steps = 3;
        config.training.eval_steps = 3;
        config.training.save_total_limit = 0;

        let mut trainer = create_trainer(temp_dir.path(), config.clone(), 8);
        trainer.train().unwrap();
        let checkpoint = temp_dir.path().join("outputs").join("checkpoint-3");
        assert!(checkpoint.exists());

        let mut resumed = create_trainer(temp_dir.path(), config, 8);
        resumed.resume_from(&checkpoint).unwrap();
        assert_eq!(resumed.state().global_step, 3);

        let output = resumed.train().unwrap();
        assert_eq!(output.global_step, 8);
    }

    #[test]
    fn test_latest_checkpoint_orders_numerically() {
        let temp_dir = TempDir::new().unwrap();
        for step in [9, 10, 150] {
            fs::create_dir_all(temp_dir.path().join(format!("checkpoint-{step}"))).unwrap();
        }
        fs::create_dir_all(temp_dir.path().join("runs")).unwrap();

        let latest = latest_checkpoint(temp_dir.path()).unwrap().unwrap();
        assert!(latest.ends_with("checkpoint-150"));
        assert_eq!(latest_checkpoint(temp_dir.path().join("none")).unwrap(), None);
    }
}
