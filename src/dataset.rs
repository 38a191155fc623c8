//! Dataset loading.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::DatasetConfig;
use crate::error::{Result, TuneError};

/// A single instruction/response record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Instruction shown to the model in the user turn.
    pub instruction: String,
    /// Target response.
    pub output: String,
}

impl Record {
    /// Create a record.
    pub fn new(instruction: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            output: output.into(),
        }
    }
}

/// Load records from a JSON-lines file.
///
/// A missing file or a malformed line is logged and yields an empty list so
/// the caller can decide whether an empty split is fatal.
pub fn load_jsonl<P: AsRef<Path>>(path: P) -> Vec<Record> {
    let path = path.as_ref();
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::error!("Dataset file not found: {}", path.display());
            return Vec::new();
        }
        Err(e) => {
            tracing::error!("Failed to read {}: {e}", path.display());
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::error!(
                    "Error decoding JSON in {} at line {}: {e}",
                    path.display(),
                    line_no + 1
                );
                return Vec::new();
            }
        }
    }

    tracing::info!("Loaded {} examples from {}", records.len(), path.display());
    records
}

/// Train, validation and test splits.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    /// Training records.
    pub train: Vec<Record>,
    /// Validation records, used for `eval_loss`.
    pub validation: Vec<Record>,
    /// Test records.
    pub test: Vec<Record>,
}

impl DatasetSplits {
    /// Load all three splits.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Dataset`] if any split ends up empty.
    pub fn load(config: &DatasetConfig) -> Result<Self> {
        let train = load_jsonl(&config.train_path);
        let validation = load_jsonl(&config.val_path);
        let test = load_jsonl(&config.test_path);

        if train.is_empty() || validation.is_empty() || test.is_empty() {
            return Err(TuneError::Dataset(
                "one or more datasets are empty".into(),
            ));
        }

        tracing::info!(
            "Dataset sizes: train={}, val={}, test={}",
            train.len(),
            validation.len(),
            test.len()
        );

        Ok(Self {
            train,
            validation,
            test,
        })
    }
}
