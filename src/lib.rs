//! # instruct-tune
//!
//! Instruction fine-tuning of causal language models with `LoRA`/`QLoRA`
//! adapters, followed by merging the adapter back into the base weights.
//!
//! A run reads `{"instruction", "output"}` JSONL splits, renders each record
//! into a chat prompt, masks everything but the response in the labels, and
//! trains low-rank adapters over a frozen (optionally quantized) decoder.
//! The final adapter is saved next to the tokenizer and then folded into a
//! standalone model directory.
//!
//! ## Quick Start
//!
//! ```bash
//! # Write a preset configuration
//! instruct-tune init --preset stablelm-3b --output config.yaml
//!
//! # Validate configuration
//! instruct-tune validate config.yaml
//!
//! # Train, save and merge
//! instruct-tune train config.yaml
//!
//! # Merge a specific checkpoint
//! instruct-tune merge --config config.yaml --adapter ./outputs/checkpoint-450 --output ./merged
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod cli;
pub mod collator;
pub mod config;
pub mod dataset;
pub mod error;
pub mod merge;
pub mod model;
pub mod optimizer;
pub mod pipeline;
pub mod prompt;
pub mod scheduler;
pub mod trainer;

pub use config::{TrainingConfig, TuneConfig};
pub use error::{Result, TuneError};
pub use trainer::{TrainOutput, Trainer};
