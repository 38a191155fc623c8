//! Shared fixtures: a tiny random Llama-style model and instruction data.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use instruct_tune::config::{AdapterType, DatasetConfig, QuantType, QuantizationSettings, TuneConfig};

pub const HIDDEN: usize = 32;
pub const INTERMEDIATE: usize = 64;
pub const VOCAB: usize = 16;
pub const LAYERS: usize = 2;
pub const KV_DIM: usize = 16;

const MODEL_CONFIG_JSON: &str = r#"{
    "model_type": "llama",
    "vocab_size": 16,
    "hidden_size": 32,
    "intermediate_size": 64,
    "num_hidden_layers": 2,
    "num_attention_heads": 4,
    "num_key_value_heads": 2,
    "rope_theta": 10000.0,
    "max_position_embeddings": 128,
    "rms_norm_eps": 1e-5,
    "tie_word_embeddings": false
}"#;

const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [
        {"id": 1, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
         "rstrip": false, "normalized": false, "special": true}
    ],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "<unk>": 0, "<|endoftext|>": 1, "<|": 2, "|>": 3, "system": 4,
            "user": 5, "assistant": 6, "what": 7, "is": 8, "two": 9,
            "plus": 10, "four": 11, "the": 12, "answer": 13, ".": 14, "?": 15
        },
        "unk_token": "<unk>"
    }
}"#;

/// Write `config.json`, `model.safetensors` and `tokenizer.json` into `dir`.
pub fn write_tiny_model(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    let device = Device::Cpu;
    let randn = |rows: usize, cols: usize| Tensor::randn(0f32, 0.05, (rows, cols), &device).unwrap();
    let ones = || Tensor::ones(HIDDEN, DType::F32, &device).unwrap();

    let mut weights = HashMap::new();
    weights.insert("model.embed_tokens.weight".to_string(), randn(VOCAB, HIDDEN));
    weights.insert("model.norm.weight".to_string(), ones());
    weights.insert("lm_head.weight".to_string(), randn(VOCAB, HIDDEN));
    for i in 0..LAYERS {
        let attn = format!("model.layers.{i}.self_attn");
        weights.insert(format!("{attn}.q_proj.weight"), randn(HIDDEN, HIDDEN));
        weights.insert(format!("{attn}.k_proj.weight"), randn(KV_DIM, HIDDEN));
        weights.insert(format!("{attn}.v_proj.weight"), randn(KV_DIM, HIDDEN));
        weights.insert(format!("{attn}.o_proj.weight"), randn(HIDDEN, HIDDEN));
        let mlp = format!("model.layers.{i}.mlp");
        weights.insert(format!("{mlp}.gate_proj.weight"), randn(INTERMEDIATE, HIDDEN));
        weights.insert(format!("{mlp}.up_proj.weight"), randn(INTERMEDIATE, HIDDEN));
        weights.insert(format!("{mlp}.down_proj.weight"), randn(HIDDEN, INTERMEDIATE));
        weights.insert(format!("model.layers.{i}.input_layernorm.weight"), ones());
        weights.insert(format!("model.layers.{i}.post_attention_layernorm.weight"), ones());
    }

    candle_core::safetensors::save(&weights, dir.join("model.safetensors")).unwrap();
    fs::write(dir.join("config.json"), MODEL_CONFIG_JSON).unwrap();
    fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
}

/// Write `count` records built from the tiny vocabulary to `path`.
pub fn write_split(path: &Path, count: usize) {
    let mut content = String::new();
    for i in 0..count {
        let (instruction, output) = if i % 2 == 0 {
            ("what is two plus two ?", "the answer is four .")
        } else {
            ("what is the answer ?", "four .")
        };
        content.push_str(&format!(
            r#"{{"instruction":"{instruction}","output":"{output}"}}"#
        ));
        content.push('\n');
    }
    fs::write(path, content).unwrap();
}

/// Model, data and a small LoRA config rooted at `root`.
pub fn create_test_setup(root: &Path) -> TuneConfig {
    let model_dir = root.join("model");
    write_tiny_model(&model_dir);

    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();
    write_split(&data_dir.join("train.jsonl"), 8);
    write_split(&data_dir.join("val.jsonl"), 4);
    write_split(&data_dir.join("test.jsonl"), 2);

    let mut config = TuneConfig::from_preset("tinyllama-1.1b").unwrap();
    config.base_model = model_dir.to_string_lossy().into_owned();
    config.adapter = AdapterType::Lora;
    config.quantization = None;
    config.lora.r = 4;
    config.lora.alpha = 8;
    config.lora.dropout = 0.0;
    config.dataset = DatasetConfig {
        max_length: 64,
        ..DatasetConfig::in_dir(data_dir.to_str().unwrap())
    };
    config.prompt.system_prompt = "the answer .".into();
    config.output_dir = root.join("outputs").to_string_lossy().into_owned();
    config.logs_dir = root.join("logs").to_string_lossy().into_owned();
    config.merged_dir = root.join("merged").to_string_lossy().into_owned();

    let t = &mut config.training;
    t.epochs = 1;
    t.train_batch_size = 2;
    t.eval_batch_size = 2;
    t.gradient_accumulation_steps = 1;
    t.learning_rate = 1e-2;
    t.warmup_steps = 0;
    t.warmup_ratio = 0.0;
    t.logging_steps = 1;
    t.eval_steps = 2;
    t.save_steps = 2;
    t.save_total_limit = 2;
    t.early_stopping_patience = 0;
    t.load_best_model_at_end = true;
    t.bf16 = false;
    config
}

/// 4-bit `Q4_0` quantization; row lengths of the tiny model divide its block.
pub fn tiny_qlora(config: &mut TuneConfig) {
    config.adapter = AdapterType::Qlora;
    config.quantization = Some(QuantizationSettings {
        bits: 4,
        quant_type: QuantType::Nf4,
        double_quant: false,
        block_size: 32,
    });
}
