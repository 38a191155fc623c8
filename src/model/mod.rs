//! Model loading, the adapter-aware decoder, and the training loss.

mod decoder;
mod tokenizer;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::adapters::{ggml_dtype, print_trainable_parameters, trainable_parameter_count};
use crate::config::{AdapterType, TuneConfig};
use crate::error::{Result, TuneError};
use crate::prompt::IGNORE_INDEX;

pub use decoder::CausalLm;
pub use tokenizer::{load_tokenizer, save_tokenizer, TokenizerBundle};

pub(crate) use decoder::LayerSource;

/// Environment variable that forces CPU execution.
pub const FORCE_CPU_ENV: &str = "INSTRUCT_TUNE_FORCE_CPU";
/// Environment variable selecting the CUDA ordinal.
pub const CUDA_DEVICE_ENV: &str = "INSTRUCT_TUNE_CUDA_DEVICE";

/// Architecture family, from `model_type` in `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// StableLM: LayerNorm, partial rotary embedding.
    StableLm,
    /// Llama and Mistral: RmsNorm, full rotary embedding.
    Llama,
}

/// The subset of a `HuggingFace` `config.json` the decoder needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// `stablelm`, `stablelm_epoch`, `llama` or `mistral`.
    #[serde(default)]
    pub model_type: String,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden size.
    pub hidden_size: usize,
    /// MLP width.
    pub intermediate_size: usize,
    /// Number of decoder layers.
    pub num_hidden_layers: usize,
    /// Number of query heads.
    pub num_attention_heads: usize,
    /// Number of key/value heads; equal to query heads when absent.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// Rotary base.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Fraction of each head that is rotated.
    #[serde(default)]
    pub partial_rotary_factor: Option<f64>,
    /// Positions the rotary table covers.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// LayerNorm epsilon (StableLM).
    #[serde(default)]
    pub layer_norm_eps: Option<f64>,
    /// RmsNorm epsilon (Llama).
    #[serde(default)]
    pub rms_norm_eps: Option<f64>,
    /// Bias on q/k/v projections (StableLM 2).
    #[serde(default)]
    pub use_qkv_bias: bool,
    /// Bias on q/k/v projections (Llama naming).
    #[serde(default)]
    pub attention_bias: bool,
    /// Reuse the embedding matrix as the output head.
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl ModelConfig {
    /// Read `config.json` from a model directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join("config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| TuneError::Model(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| TuneError::Model(format!("invalid {}: {e}", path.display())))
    }

    /// Architecture family.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported `model_type` values.
    pub fn family(&self) -> Result<ModelFamily> {
        match self.model_type.as_str() {
            "stablelm" | "stablelm_epoch" | "stablelm-epoch" => Ok(ModelFamily::StableLm),
            "llama" | "mistral" => Ok(ModelFamily::Llama),
            other => Err(TuneError::Model(format!("unsupported model_type: {other:?}"))),
        }
    }

    /// Per-head width.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Key/value head count.
    #[must_use]
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Number of rotated dimensions per head.
    #[must_use]
    pub fn rotary_ndims(&self) -> usize {
        let factor = self.partial_rotary_factor.unwrap_or(1.0);
        (self.head_dim() as f64 * factor) as usize
    }

    /// Normalization epsilon for this family.
    #[must_use]
    pub fn norm_eps(&self) -> f64 {
        self.layer_norm_eps.or(self.rms_norm_eps).unwrap_or(1e-5)
    }

    /// Whether q/k/v projections carry a bias.
    #[must_use]
    pub fn qkv_bias(&self) -> bool {
        self.use_qkv_bias || self.attention_bias
    }

    /// Input and output widths of a target projection.
    #[must_use]
    pub fn target_dims(&self, target: &str) -> (usize, usize) {
        let kv_dim = self.num_kv_heads() * self.head_dim();
        match target {
            "k_proj" | "v_proj" => (self.hidden_size, kv_dim),
            "gate_proj" | "up_proj" => (self.hidden_size, self.intermediate_size),
            "down_proj" => (self.intermediate_size, self.hidden_size),
            _ => (self.hidden_size, self.hidden_size),
        }
    }

    /// Check shapes the decoder relies on.
    ///
    /// # Errors
    ///
    /// Returns an error if head counts or rotary width do not divide evenly.
    pub fn validate(&self) -> Result<()> {
        self.family()?;
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(TuneError::Model(
                "hidden_size must be divisible by num_attention_heads".into(),
            ));
        }
        if self.num_kv_heads() == 0 || self.num_attention_heads % self.num_kv_heads() != 0 {
            return Err(TuneError::Model(
                "num_attention_heads must be divisible by num_key_value_heads".into(),
            ));
        }
        if self.rotary_ndims() % 2 != 0 {
            return Err(TuneError::Model("rotary dimension must be even".into()));
        }
        Ok(())
    }
}

/// Pick the training device.
///
/// CUDA is used when compiled with the `cuda` feature and available, unless
/// `INSTRUCT_TUNE_FORCE_CPU=1`.
#[must_use]
pub fn select_device() -> Device {
    let force_cpu = std::env::var(FORCE_CPU_ENV)
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let ordinal = std::env::var(CUDA_DEVICE_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if force_cpu {
        tracing::warn!("CPU mode forced via {FORCE_CPU_ENV}");
        return Device::Cpu;
    }
    if !cfg!(feature = "cuda") {
        tracing::info!("Built without the cuda feature; training on CPU");
        return Device::Cpu;
    }
    match Device::cuda_if_available(ordinal) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device {ordinal})");
            device
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}

/// Frozen-weight dtype: bf16 on accelerators when enabled, else f32.
#[must_use]
pub fn compute_dtype(bf16: bool, device: &Device) -> DType {
    if bf16 && !device.is_cpu() {
        DType::BF16
    } else {
        DType::F32
    }
}

/// Resolve a model identifier to a local directory.
///
/// Tries, in order: a local path, the `HuggingFace` cache (`$HF_HOME/hub`,
/// else `~/.cache/huggingface/hub`), and a hub download when built with the
/// `download` feature.
///
/// # Errors
///
/// Returns an error if the model cannot be found.
pub fn resolve_model_path(model_id: &str) -> Result<PathBuf> {
    let path = PathBuf::from(model_id);
    if path.is_dir() {
        return Ok(path);
    }

    let cache = hf_hub::Cache::from_env();
    if let Some(dir) = cached_model_dir(&cache, model_id) {
        tracing::debug!("Using cached snapshot {}", dir.display());
        return Ok(dir);
    }

    #[cfg(feature = "download")]
    {
        download_model(model_id)
    }
    #[cfg(not(feature = "download"))]
    {
        Err(TuneError::Model(format!(
            "Model not found at '{model_id}' or in HF cache at '{}'. \
             Build with --features download or fetch it with `huggingface-cli download {model_id}`.",
            cache.path().display()
        )))
    }
}

/// Snapshot directory that the cache's `main` ref points at, if it holds a
/// `config.json`.
fn cached_model_dir(cache: &hf_hub::Cache, model_id: &str) -> Option<PathBuf> {
    cache
        .model(model_id.to_string())
        .get("config.json")
        .and_then(|config| config.parent().map(Path::to_path_buf))
}

/// Download config, tokenizer and weights from the hub.
#[cfg(feature = "download")]
fn download_model(model_id: &str) -> Result<PathBuf> {
    use hf_hub::api::sync::Api;

    let hub_err = |e: hf_hub::api::sync::ApiError| TuneError::Model(format!("hub download failed: {e}"));
    tracing::info!("Downloading {model_id} from the HuggingFace hub");

    let api = Api::new().map_err(hub_err)?;
    let repo = api.model(model_id.to_string());
    let config = repo.get("config.json").map_err(hub_err)?;
    repo.get("tokenizer.json").map_err(hub_err)?;
    for optional in ["tokenizer_config.json", "special_tokens_map.json"] {
        if let Err(e) = repo.get(optional) {
            tracing::debug!("{optional} not downloaded: {e}");
        }
    }

    match repo.get("model.safetensors.index.json") {
        Ok(index) => {
            let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(index)?)?;
            let mut shards: Vec<String> = index["weight_map"]
                .as_object()
                .map(|m| m.values().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            shards.sort();
            shards.dedup();
            for shard in shards {
                repo.get(&shard).map_err(hub_err)?;
            }
        }
        Err(_) => {
            repo.get("model.safetensors").map_err(hub_err)?;
        }
    }

    config
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| TuneError::Model("hub returned a path without parent".into()))
}

/// Read every `*.safetensors` file in `dir` onto `device`.
///
/// # Errors
///
/// Returns an error if no weight file exists or one cannot be read.
pub fn load_weights<P: AsRef<Path>>(dir: P, device: &Device) -> Result<HashMap<String, Tensor>> {
    let dir = dir.as_ref();
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(TuneError::Model(format!(
            "No model weights found in {}. Expected *.safetensors",
            dir.display()
        )));
    }

    let mut weights = HashMap::new();
    for file in &files {
        weights.extend(candle_core::safetensors::load(file, device)?);
    }
    tracing::debug!("Read {} tensors from {} file(s)", weights.len(), files.len());
    Ok(weights)
}

/// A model ready for training.
pub struct LoadedModel {
    /// Decoder with adapters injected.
    pub model: CausalLm,
    /// Trainable adapter parameters.
    pub varmap: VarMap,
    /// Parsed `config.json`.
    pub config: ModelConfig,
    /// Directory the base model was read from.
    pub model_path: PathBuf,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model", &self.model)
            .field("trainable_parameters", &self.trainable_parameters())
            .field("config", &self.config)
            .field("model_path", &self.model_path)
            .finish()
    }
}

impl LoadedModel {
    /// Number of trainable values.
    #[must_use]
    pub fn trainable_parameters(&self) -> usize {
        trainable_parameter_count(&self.varmap)
    }

    /// Number of all values, frozen and trainable.
    #[must_use]
    pub fn total_parameters(&self) -> usize {
        self.model.num_frozen_parameters() + self.trainable_parameters()
    }
}

/// Load the base model, quantize its projections and attach adapters.
///
/// # Errors
///
/// Returns an error if the model files are missing or inconsistent.
pub fn load_model(config: &TuneConfig, device: &Device) -> Result<LoadedModel> {
    tracing::info!("Loading model: {}", config.base_model);
    let model_path = resolve_model_path(&config.base_model)?;
    load_model_from_dir(config, &model_path, device)
}

/// [`load_model`] for an already resolved directory.
///
/// # Errors
///
/// Returns an error if the model files are missing or inconsistent.
pub fn load_model_from_dir(config: &TuneConfig, model_path: &Path, device: &Device) -> Result<LoadedModel> {
    let model_config = ModelConfig::from_dir(model_path)?;
    model_config.validate()?;
    tracing::info!(
        "Model info: type={}, hidden_size={}, num_layers={}, kv_heads={}",
        model_config.model_type,
        model_config.hidden_size,
        model_config.num_hidden_layers,
        model_config.num_kv_heads()
    );

    let dtype = compute_dtype(config.training.bf16, device);
    if config.training.gradient_checkpointing {
        tracing::warn!("gradient_checkpointing is not supported by this backend; activations are kept");
    }

    let weights = load_weights(model_path, device)?;
    let varmap = VarMap::new();
    let quant = match config.adapter {
        AdapterType::Qlora => config.quantization.as_ref(),
        AdapterType::Lora | AdapterType::None => None,
    };
    if let Some(settings) = quant {
        let format = ggml_dtype(settings);
        if settings.block_size != format.block_size() {
            tracing::warn!(
                "quantization.block_size={} ignored; {format:?} uses blocks of {}",
                settings.block_size,
                format.block_size()
            );
        }
    }
    let lora = match config.adapter {
        AdapterType::None => None,
        AdapterType::Lora | AdapterType::Qlora => Some((&config.lora, &varmap)),
    };

    let source = LayerSource {
        weights: &weights,
        dtype,
        device,
        lora,
        quant,
        rng: RefCell::new(StdRng::seed_from_u64(config.seed)),
    };
    let model = CausalLm::load(&model_config, &source)?;
    drop(weights);

    let loaded = LoadedModel {
        model,
        varmap,
        config: model_config,
        model_path: model_path.to_path_buf(),
    };

    tracing::info!(
        "Model loaded on {:?} with dtype {:?}, {} quantized projections",
        device,
        dtype,
        loaded.model.num_quantized_projections()
    );
    print_trainable_parameters(loaded.trainable_parameters(), loaded.total_parameters());
    Ok(loaded)
}

/// Mean next-token cross entropy over positions whose label is not
/// [`IGNORE_INDEX`].
///
/// `logits` is `(batch, seq, vocab)`, `labels` is `(batch, seq)` `i64`.
/// Position `t` predicts label `t + 1`.
///
/// # Errors
///
/// Returns an error if no position carries a label.
pub fn causal_lm_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (b_sz, seq_len, vocab) = logits.dims3()?;
    if seq_len < 2 {
        return Err(TuneError::Training("sequence too short for next-token loss".into()));
    }

    let logits = logits
        .narrow(1, 0, seq_len - 1)?
        .to_dtype(DType::F32)?
        .reshape((b_sz * (seq_len - 1), vocab))?;
    let labels = labels
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::I64)?
        .reshape(b_sz * (seq_len - 1))?;

    let valid = labels.ne(IGNORE_INDEX)?;
    let count = valid.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Err(TuneError::Training("batch has no label tokens".into()));
    }

    let targets = valid
        .where_cond(&labels, &labels.zeros_like()?)?
        .to_dtype(DType::U32)?
        .unsqueeze(1)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&targets, 1)?.squeeze(1)?;
    let picked = (picked * valid.to_dtype(DType::F32)?)?;

    Ok((picked.sum_all()?.neg()? / f64::from(count))?)
}

#[cfg(test)]
pub(crate) mod testing {
    //! A tiny random Llama-style model written to disk for tests.

    use super::*;

    pub(crate) const TOKENIZER_JSON: &str = r#"{
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

    pub(crate) fn tiny_config() -> ModelConfig {
        ModelConfig {
            model_type: "llama".into(),
            vocab_size: 16,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            rope_theta: 10_000.0,
            partial_rotary_factor: None,
            max_position_embeddings: 128,
            layer_norm_eps: None,
            rms_norm_eps: Some(1e-5),
            use_qkv_bias: false,
            attention_bias: false,
            tie_word_embeddings: false,
        }
    }

    /// Write `config.json`, `model.safetensors` and `tokenizer.json` into `dir`.
    pub(crate) fn write_tiny_model(dir: &Path) -> ModelConfig {
        let cfg = tiny_config();
        let device = Device::Cpu;
        let randn = |shape: (usize, usize)| Tensor::randn(0f32, 0.05, shape, &device).unwrap();
        let ones = || Tensor::ones(cfg.hidden_size, DType::F32, &device).unwrap();

        let mut weights = HashMap::new();
        weights.insert("model.embed_tokens.weight".to_string(), randn((cfg.vocab_size, cfg.hidden_size)));
        weights.insert("model.norm.weight".to_string(), ones());
        weights.insert("lm_head.weight".to_string(), randn((cfg.vocab_size, cfg.hidden_size)));
        for i in 0..cfg.num_hidden_layers {
            let prefix = format!("model.layers.{i}");
            for target in ["q_proj", "k_proj", "v_proj", "o_proj"] {
                let (in_dim, out_dim) = cfg.target_dims(target);
                weights.insert(format!("{prefix}.self_attn.{target}.weight"), randn((out_dim, in_dim)));
            }
            for target in ["gate_proj", "up_proj", "down_proj"] {
                let (in_dim, out_dim) = cfg.target_dims(target);
                weights.insert(format!("{prefix}.mlp.{target}.weight"), randn((out_dim, in_dim)));
            }
            weights.insert(format!("{prefix}.input_layernorm.weight"), ones());
            weights.insert(format!("{prefix}.post_attention_layernorm.weight"), ones());
        }

        candle_core::safetensors::save(&weights, dir.join("model.safetensors")).unwrap();
        std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&cfg).unwrap()).unwrap();
        std::fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
        cfg
    }
}
