//! Command-line interface.
//!
//! ```bash
//! instruct-tune init --preset stablelm-3b --output config.yaml
//! instruct-tune validate config.yaml
//! instruct-tune train config.yaml
//! instruct-tune merge --config config.yaml --adapter ./outputs/checkpoint-450 --output ./merged
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::TuneConfig;
use crate::error::{Result, TuneError};
use crate::merge::merge_adapter;
use crate::model::{load_tokenizer, resolve_model_path};
use crate::pipeline;

/// Instruction fine-tuning with LoRA/QLoRA adapters.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "instruct-tune")]
#[command(version)]
#[command(about = "Fine-tune causal language models on instruction data with LoRA/QLoRA and merge the adapter")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging (overridden by `RUST_LOG`)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Train, save and merge from a YAML configuration
    Train(TrainArgs),

    /// Validate a configuration file without training
    Validate(ValidateArgs),

    /// Write a preset configuration to a file
    Init(InitArgs),

    /// Merge a trained adapter into its base model
    Merge(MergeArgs),
}

/// Arguments for the train command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct TrainArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Resume from a checkpoint directory, or `latest`
    #[arg(short, long)]
    pub resume: Option<String>,

    /// Override number of epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Override output directory
    #[arg(short, long)]
    pub output_dir: Option<String>,
}

/// Arguments for the validate command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ValidateArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}

/// Arguments for the init command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InitArgs {
    /// Preset name
    #[arg(short, long, default_value = "stablelm-3b")]
    pub preset: String,

    /// Where to write the configuration
    #[arg(short, long, default_value = "config.yaml")]
    pub output: PathBuf,
}

/// Arguments for the merge command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct MergeArgs {
    /// Path to YAML configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Adapter directory; defaults to the configured `output_dir`
    #[arg(short, long)]
    pub adapter: Option<PathBuf>,

    /// Output directory; defaults to the configured `merged_dir`
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Execute a parsed command.
///
/// # Errors
///
/// Returns an error if the command fails. A training run that fails inside
/// the training loop is reported as [`TuneError::Training`].
pub fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Train(args) => train(&args),
        Command::Validate(args) => {
            let config = TuneConfig::from_file(&args.config)?;
            config.validate()?;
            tracing::info!("Configuration is valid: {}", args.config.display());
            tracing::info!("  Base model: {}", config.base_model);
            tracing::info!("  Adapter: {:?}", config.adapter);
            tracing::info!(
                "  Effective batch size: {}",
                config.training.effective_batch_size()
            );
            Ok(())
        }
        Command::Init(args) => {
            let config = TuneConfig::from_preset(&args.preset)?;
            config.to_file(&args.output)?;
            tracing::info!(
                "Wrote {} preset to {}",
                args.preset,
                args.output.display()
            );
            Ok(())
        }
        Command::Merge(args) => merge(&args),
    }
}

fn train(args: &TrainArgs) -> Result<()> {
    let mut config = TuneConfig::from_file(&args.config)?;
    if let Some(resume) = &args.resume {
        config.training.resume_from_checkpoint = Some(resume.clone());
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(output_dir) = &args.output_dir {
        config.output_dir.clone_from(output_dir);
    }

    match pipeline::run(&config)? {
        Some(output) => {
            tracing::info!(
                "Done: {} steps, train_loss={:.4}",
                output.global_step,
                output.training_loss
            );
            Ok(())
        }
        None => Err(TuneError::Training("training failed, model not saved".into())),
    }
}

fn merge(args: &MergeArgs) -> Result<()> {
    let config = TuneConfig::from_file(&args.config)?;
    let adapter = args
        .adapter
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.output_dir));
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.merged_dir));

    let tokenizer_dir = if adapter.join("tokenizer.json").exists() {
        adapter.clone()
    } else {
        resolve_model_path(&config.base_model)?
    };
    let tokenizer = load_tokenizer(&tokenizer_dir)?;

    merge_adapter(&config.base_model, &adapter, &output, &tokenizer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_train_command() {
        let cli = Cli::try_parse_from(["instruct-tune", "train", "config.yaml", "--resume", "latest"])
            .unwrap();
        match cli.command {
            Command::Train(args) => {
                assert_eq!(args.config, PathBuf::from("config.yaml"));
                assert_eq!(args.resume.as_deref(), Some("latest"));
                assert_eq!(args.epochs, None);
            }
            _ => panic!("Expected Train command"),
        }
    }

    #[test]
    fn test_parse_merge_command() {
        let cli = Cli::try_parse_from([
            "instruct-tune",
            "merge",
            "--config",
            "config.yaml",
            "--adapter",
            "./outputs/checkpoint-450",
            "--output",
            "./merged",
        ])
        .unwrap();
        match cli.command {
            Command::Merge(args) => {
                assert_eq!(args.adapter, Some(PathBuf::from("./outputs/checkpoint-450")));
                assert_eq!(args.output, Some(PathBuf::from("./merged")));
            }
            _ => panic!("Expected Merge command"),
        }
    }

    #[test]
    fn test_init_then_validate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        execute(Cli {
            command: Command::Init(InitArgs {
                preset: "tinyllama-1.1b".into(),
                output: path.clone(),
            }),
            verbose: false,
        })
        .unwrap();
        assert!(path.exists());

        execute(Cli {
            command: Command::Validate(ValidateArgs { config: path }),
            verbose: false,
        })
        .unwrap();
    }

    #[test]
    fn test_init_unknown_preset() {
        let dir = TempDir::new().unwrap();
        let result = execute(Cli {
            command: Command::Init(InitArgs {
                preset: "gpt-9".into(),
                output: dir.path().join("config.yaml"),
            }),
            verbose: false,
        });
        assert!(matches!(result, Err(TuneError::Config(_))));
    }
}
