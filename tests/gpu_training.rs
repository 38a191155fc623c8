//! GPU fine-tuning smoke test against a real checkpoint.
//!
//! Run with: `INSTRUCT_TUNE_GPU_MODEL=TinyLlama/TinyLlama-1.1B-Chat-v1.0 cargo test --features 'cuda download' -- --ignored gpu`

#![cfg(feature = "cuda")]

use std::path::Path;
use std::time::Instant;

use instruct_tune::adapters::ADAPTER_WEIGHTS_FILE;
use instruct_tune::config::{AdapterType, DatasetConfig, QuantizationSettings};
use instruct_tune::pipeline;
use instruct_tune::TuneConfig;
use tempfile::TempDir;

const GPU_MODEL_ENV: &str = "INSTRUCT_TUNE_GPU_MODEL";

fn write_dataset(dir: &Path, count: usize) {
    for (name, n) in [("train.jsonl", count), ("val.jsonl", count / 4), ("test.jsonl", 2)] {
        let mut content = String::new();
        for i in 0..n.max(2) {
            content.push_str(&format!(
                r#"{{"instruction":"Summarize admission {i}: chest pain, troponin negative.","output":"Patient {i} admitted for chest pain; ACS ruled out; discharged home."}}"#
            ));
            content.push('\n');
        }
        std::fs::write(dir.join(name), content).unwrap();
    }
}

#[test]
#[ignore = "requires a CUDA device and model weights"]
fn test_gpu_qlora_quick_iteration() {
    let Ok(model_id) = std::env::var(GPU_MODEL_ENV) else {
        eprintln!("{GPU_MODEL_ENV} not set; skipping");
        return;
    };
    let temp_dir = TempDir::new().unwrap();
    write_dataset(temp_dir.path(), 32);

    let mut config = TuneConfig::from_preset("tinyllama-1.1b").unwrap();
    config.base_model = model_id;
    config.adapter = AdapterType::Qlora;
    config.quantization = Some(QuantizationSettings::default());
    config.dataset = DatasetConfig {
        max_length: 256,
        ..DatasetConfig::in_dir(temp_dir.path().to_str().unwrap())
    };
    config.output_dir = temp_dir.path().join("out").to_string_lossy().into_owned();
    config.logs_dir = temp_dir.path().join("logs").to_string_lossy().into_owned();
    config.merged_dir = temp_dir.path().join("merged").to_string_lossy().into_owned();
    config.training.epochs = 1;
    config.training.train_batch_size = 2;
    config.training.eval_batch_size = 2;
    config.training.bf16 = true;
    config.training.save_steps = 8;
    config.training.eval_steps = 8;

    let start = Instant::now();
    let output = pipeline::run(&config).unwrap().expect("training should succeed");
    println!(
        "{} steps in {:.1}s, loss {:.4}",
        output.global_step,
        start.elapsed().as_secs_f64(),
        output.training_loss
    );
    assert!(output.training_loss.is_finite());
    assert!(Path::new(&config.output_dir).join(ADAPTER_WEIGHTS_FILE).exists());
}
