//! Error types for instruct-tune.

use thiserror::Error;

/// Result type alias for instruct-tune operations.
pub type Result<T> = std::result::Result<T, TuneError>;

/// Everything that can stop a fine-tuning run or a merge.
///
/// String variants carry a message naming the offending file, key or
/// tensor; wrapped library errors keep their source for the cause chain
/// printed by [`crate::pipeline::start_training`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TuneError {
    /// A configuration value is missing or out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The YAML config could not be parsed.
    #[error("cannot parse YAML config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Base model files are missing, unsupported or inconsistent.
    #[error("model: {0}")]
    Model(String),

    /// A split is empty or nothing survived tokenization.
    #[error("dataset: {0}")]
    Dataset(String),

    /// The training loop cannot continue.
    #[error("training failed: {0}")]
    Training(String),

    /// A checkpoint or adapter directory cannot be read or written.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// Filesystem error.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    /// `config.json`, `adapter_config.json` or trainer state is malformed.
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Tensor operation failed; CUDA out-of-memory surfaces here.
    #[error("tensor op: {0}")]
    Candle(#[from] candle_core::Error),

    /// `tokenizer.json` failed to load, encode or save.
    #[error("tokenizer: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// Bad progress bar template.
    #[error("progress bar template: {0}")]
    Template(#[from] indicatif::style::TemplateError),

    /// Anything else, such as a poisoned lock.
    #[error("{0}")]
    Other(String),
}
