//! Configuration parsing and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

/// Main configuration for a fine-tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneConfig {
    /// Base model identifier (`HuggingFace` model ID or local path).
    pub base_model: String,

    /// Adapter type.
    #[serde(default)]
    pub adapter: AdapterType,

    /// `LoRA` configuration.
    #[serde(default)]
    pub lora: LoraSettings,

    /// Quantization configuration (required for `QLoRA`). Defaults to 4-bit
    /// NF4 to match the default adapter; `quantization: null` clears it.
    #[serde(default = "default_quantization")]
    pub quantization: Option<QuantizationSettings>,

    /// Dataset configuration.
    pub dataset: DatasetConfig,

    /// Prompt rendering.
    #[serde(default)]
    pub prompt: PromptSettings,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Directory for adapter checkpoints and the final adapter.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Directory for the JSONL training log.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,

    /// Directory for the merged full model.
    #[serde(default = "default_merged_dir")]
    pub merged_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs/checkpoints".into()
}

fn default_logs_dir() -> String {
    "./outputs/logs".into()
}

fn default_merged_dir() -> String {
    "./outputs/merged".into()
}

fn default_seed() -> u64 {
    42
}

fn default_quantization() -> Option<QuantizationSettings> {
    Some(QuantizationSettings::default())
}

/// Adapter type for fine-tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    /// No adapter; every projection stays frozen.
    None,
    /// Standard `LoRA` over a full-precision base.
    Lora,
    /// `LoRA` over a 4-bit quantized base.
    #[default]
    Qlora,
}

/// LoRA-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraSettings {
    /// Rank of low-rank decomposition.
    #[serde(default = "default_lora_r")]
    pub r: usize,

    /// Scaling factor.
    #[serde(default = "default_lora_alpha")]
    pub alpha: usize,

    /// Dropout probability on the adapter input.
    #[serde(default = "default_lora_dropout")]
    pub dropout: f64,

    /// Target modules for `LoRA`.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
}

fn default_lora_r() -> usize {
    16
}
fn default_lora_alpha() -> usize {
    32
}
fn default_lora_dropout() -> f64 {
    0.1
}
fn default_target_modules() -> Vec<String> {
    [
        "q_proj",
        "k_proj",
        "v_proj",
        "o_proj",
        "up_proj",
        "down_proj",
        "gate_proj",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            r: default_lora_r(),
            alpha: default_lora_alpha(),
            dropout: default_lora_dropout(),
            target_modules: default_target_modules(),
        }
    }
}

impl LoraSettings {
    /// Scale applied to the low-rank update (`alpha / r`).
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.alpha as f64 / self.r as f64
    }
}

/// Quantization settings for `QLoRA`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationSettings {
    /// Number of bits (4 or 8).
    #[serde(default = "default_bits")]
    pub bits: u8,

    /// Quantization type.
    #[serde(default)]
    pub quant_type: QuantType,

    /// Use double quantization (quantized block scales).
    #[serde(default = "default_true")]
    pub double_quant: bool,

    /// Block size for quantization.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

fn default_bits() -> u8 {
    4
}
fn default_true() -> bool {
    true
}
fn default_block_size() -> usize {
    64
}

impl Default for QuantizationSettings {
    fn default() -> Self {
        Self {
            bits: default_bits(),
            quant_type: QuantType::Nf4,
            double_quant: true,
            block_size: default_block_size(),
        }
    }
}

/// Quantization type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    /// 4-bit `NormalFloat`.
    #[default]
    Nf4,
    /// 4-bit float point.
    Fp4,
}

/// Dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Training split (JSONL with `instruction` and `output`).
    pub train_path: String,

    /// Validation split.
    pub val_path: String,

    /// Held-out test split. Loaded and checked, never trained on.
    pub test_path: String,

    /// Maximum sequence length (prompt + response + EOS).
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_max_length() -> usize {
    1648
}

impl DatasetConfig {
    /// Dataset rooted at `dir` with the conventional `train/val/test.jsonl` names.
    #[must_use]
    pub fn in_dir(dir: &str) -> Self {
        let dir = dir.trim_end_matches('/');
        Self {
            train_path: format!("{dir}/train.jsonl"),
            val_path: format!("{dir}/val.jsonl"),
            test_path: format!("{dir}/test.jsonl"),
            max_length: default_max_length(),
        }
    }
}

/// Prompt rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSettings {
    /// System message placed in the `<|system|>` block.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_system_prompt() -> String {
    "You are a highly skilled medical AI assistant specialized in generating comprehensive, \
     accurate medical discharge reports. You have extensive knowledge of medical terminology, \
     procedures, and documentation standards."
        .into()
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Micro-batch size for training.
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,

    /// Batch size for evaluation.
    #[serde(default = "default_eval_batch_size")]
    pub eval_batch_size: usize,

    /// Gradient accumulation steps.
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,

    /// Peak learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Learning rate scheduler.
    #[serde(default)]
    pub lr_scheduler: LrScheduler,

    /// Warmup ratio, used when `warmup_steps` is zero.
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,

    /// Explicit warmup steps. Takes precedence over `warmup_ratio`.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,

    /// Weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Maximum gradient norm for clipping.
    #[serde(default = "default_grad_norm")]
    pub max_grad_norm: f64,

    /// Adam beta1.
    #[serde(default = "default_beta1")]
    pub adam_beta1: f64,

    /// Adam beta2.
    #[serde(default = "default_beta2")]
    pub adam_beta2: f64,

    /// Adam epsilon.
    #[serde(default = "default_adam_epsilon")]
    pub adam_epsilon: f64,

    /// Save checkpoint every N optimizer steps.
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,

    /// Evaluate every N optimizer steps.
    #[serde(default = "default_eval_steps")]
    pub eval_steps: usize,

    /// Log every N optimizer steps.
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,

    /// Number of checkpoints kept on disk (the best one is always kept).
    #[serde(default = "default_save_total_limit")]
    pub save_total_limit: usize,

    /// Reload the adapter with the lowest `eval_loss` after training.
    #[serde(default = "default_true")]
    pub load_best_model_at_end: bool,

    /// Stop after this many evaluations without improvement (0 disables).
    #[serde(default = "default_patience")]
    pub early_stopping_patience: usize,

    /// Group examples of similar length into the same batch.
    #[serde(default = "default_true")]
    pub group_by_length: bool,

    /// Drop the last incomplete training batch.
    #[serde(default = "default_true")]
    pub dataloader_drop_last: bool,

    /// Use gradient checkpointing.
    #[serde(default = "default_true")]
    pub gradient_checkpointing: bool,

    /// Compute in bf16 on accelerators.
    #[serde(default = "default_true")]
    pub bf16: bool,

    /// Resume from this checkpoint directory.
    #[serde(default)]
    pub resume_from_checkpoint: Option<String>,
}

fn default_epochs() -> usize {
    3
}
fn default_train_batch_size() -> usize {
    2
}
fn default_eval_batch_size() -> usize {
    4
}
fn default_grad_accum() -> usize {
    4
}
fn default_lr() -> f64 {
    1e-4
}
fn default_warmup_ratio() -> f64 {
    0.05
}
fn default_warmup_steps() -> usize {
    100
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_grad_norm() -> f64 {
    1.0
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_adam_epsilon() -> f64 {
    1e-8
}
fn default_save_steps() -> usize {
    150
}
fn default_eval_steps() -> usize {
    150
}
fn default_log_steps() -> usize {
    50
}
fn default_save_total_limit() -> usize {
    2
}
fn default_patience() -> usize {
    5
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            train_batch_size: default_train_batch_size(),
            eval_batch_size: default_eval_batch_size(),
            gradient_accumulation_steps: default_grad_accum(),
            learning_rate: default_lr(),
            lr_scheduler: LrScheduler::Cosine,
            warmup_ratio: default_warmup_ratio(),
            warmup_steps: default_warmup_steps(),
            weight_decay: default_weight_decay(),
            max_grad_norm: default_grad_norm(),
            adam_beta1: default_beta1(),
            adam_beta2: default_beta2(),
            adam_epsilon: default_adam_epsilon(),
            save_steps: default_save_steps(),
            eval_steps: default_eval_steps(),
            logging_steps: default_log_steps(),
            save_total_limit: default_save_total_limit(),
            load_best_model_at_end: true,
            early_stopping_patience: default_patience(),
            group_by_length: true,
            dataloader_drop_last: true,
            gradient_checkpointing: true,
            bf16: true,
            resume_from_checkpoint: None,
        }
    }
}

impl TrainingConfig {
    /// Examples consumed per optimizer step.
    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        self.train_batch_size * self.gradient_accumulation_steps
    }

    /// Warmup length for a run of `total_steps` optimizer steps.
    #[must_use]
    pub fn warmup_steps_for(&self, total_steps: usize) -> usize {
        if self.warmup_steps > 0 {
            self.warmup_steps
        } else {
            (total_steps as f64 * self.warmup_ratio).ceil() as usize
        }
    }
}

/// Learning rate scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrScheduler {
    /// Cosine annealing.
    #[default]
    Cosine,
    /// Linear decay.
    Linear,
    /// Constant learning rate.
    Constant,
}

impl TuneConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// # Errors
    ///
    /// Returns an error if the preset name is unknown.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "stablelm-3b" => Ok(Self::stablelm_3b_preset()),
            "tinyllama-1.1b" => Ok(Self::tinyllama_preset()),
            _ => Err(TuneError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Names accepted by [`TuneConfig::from_preset`].
    #[must_use]
    pub fn preset_names() -> &'static [&'static str] {
        &["stablelm-3b", "tinyllama-1.1b"]
    }

    fn stablelm_3b_preset() -> Self {
        Self {
            base_model: "stabilityai/stablelm-3b-4e1t".into(),
            adapter: AdapterType::Qlora,
            lora: LoraSettings::default(),
            quantization: Some(QuantizationSettings::default()),
            dataset: DatasetConfig::in_dir("./data"),
            prompt: PromptSettings::default(),
            training: TrainingConfig::default(),
            output_dir: "./outputs/stablelm_checkpoints".into(),
            logs_dir: "./outputs/stablelm_logs".into(),
            merged_dir: "./outputs/stablelm_merged".into(),
            seed: 42,
        }
    }

    fn tinyllama_preset() -> Self {
        Self {
            base_model: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".into(),
            adapter: AdapterType::Qlora,
            lora: LoraSettings {
                r: 32,
                alpha: 64,
                ..Default::default()
            },
            quantization: Some(QuantizationSettings::default()),
            dataset: DatasetConfig {
                max_length: 1024,
                ..DatasetConfig::in_dir("./data")
            },
            prompt: PromptSettings::default(),
            training: TrainingConfig {
                train_batch_size: 8,
                gradient_accumulation_steps: 1,
                learning_rate: 2e-4,
                save_steps: 100,
                eval_steps: 100,
                early_stopping_patience: 3,
                bf16: false,
                ..Default::default()
            },
            output_dir: "./outputs/tinyllama_checkpoints".into(),
            logs_dir: "./outputs/tinyllama_logs".into(),
            merged_dir: "./outputs/tinyllama_merged".into(),
            seed: 42,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.base_model.is_empty() {
            return Err(TuneError::Config("base_model is required".into()));
        }

        for (name, path) in [
            ("dataset.train_path", &self.dataset.train_path),
            ("dataset.val_path", &self.dataset.val_path),
            ("dataset.test_path", &self.dataset.test_path),
        ] {
            if path.is_empty() {
                return Err(TuneError::Config(format!("{name} is required")));
            }
        }

        if self.dataset.max_length == 0 {
            return Err(TuneError::Config("dataset.max_length must be > 0".into()));
        }

        if self.adapter != AdapterType::None {
            if self.lora.r == 0 {
                return Err(TuneError::Config("lora.r must be > 0".into()));
            }
            if self.lora.target_modules.is_empty() {
                return Err(TuneError::Config(
                    "lora.target_modules must not be empty".into(),
                ));
            }
            if !(0.0..1.0).contains(&self.lora.dropout) {
                return Err(TuneError::Config("lora.dropout must be in [0, 1)".into()));
            }
        }

        match (&self.adapter, &self.quantization) {
            (AdapterType::Qlora, None) => {
                return Err(TuneError::Config(
                    "quantization config required for QLoRA".into(),
                ));
            }
            (_, Some(quant)) if quant.bits != 4 && quant.bits != 8 => {
                return Err(TuneError::Config(format!(
                    "quantization.bits must be 4 or 8, got {}",
                    quant.bits
                )));
            }
            _ => {}
        }

        let t = &self.training;
        if t.epochs == 0 || t.train_batch_size == 0 || t.eval_batch_size == 0 {
            return Err(TuneError::Config(
                "training epochs and batch sizes must be > 0".into(),
            ));
        }
        if t.gradient_accumulation_steps == 0 {
            return Err(TuneError::Config(
                "training.gradient_accumulation_steps must be > 0".into(),
            ));
        }
        if t.save_steps == 0 || t.eval_steps == 0 || t.logging_steps == 0 {
            return Err(TuneError::Config(
                "save_steps, eval_steps and logging_steps must be > 0".into(),
            ));
        }
        if t.learning_rate <= 0.0 {
            return Err(TuneError::Config("learning_rate must be > 0".into()));
        }
        if t.load_best_model_at_end && t.save_steps % t.eval_steps != 0 {
            return Err(TuneError::Config(
                "load_best_model_at_end requires save_steps to be a multiple of eval_steps"
                    .into(),
            ));
        }

        Ok(())
    }
}
