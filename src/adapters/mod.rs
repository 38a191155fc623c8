//! `LoRA` adapters over frozen, optionally quantized projections.
//!
//! Adapter files use the PEFT layout so that checkpoints can be loaded by
//! other tooling: `adapter_model.safetensors` holds
//! `base_model.model.{module}.lora_A.weight` / `lora_B.weight`, and
//! `adapter_config.json` holds the rank, alpha and target modules.

mod lora;
mod quantized;

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::LoraSettings;
use crate::error::{Result, TuneError};

pub use lora::{FrozenWeight, LoraAdapter, LoraLinear};
pub use quantized::{ggml_dtype, QuantizedWeight};

/// Adapter weights file name.
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
/// Adapter config file name.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

const PEFT_PREFIX: &str = "base_model.model.";

/// PEFT-compatible `adapter_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Base model the adapter was trained on.
    pub base_model_name_or_path: String,
    /// Rank.
    pub r: usize,
    /// Scaling numerator.
    pub lora_alpha: usize,
    /// Dropout used during training.
    pub lora_dropout: f64,
    /// Module names that carry an adapter.
    pub target_modules: Vec<String>,
    /// Bias handling. Always `"none"`.
    #[serde(default = "default_bias")]
    pub bias: String,
    /// Always `"CAUSAL_LM"`.
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Always `"LORA"`.
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
}

fn default_bias() -> String {
    "none".into()
}
fn default_task_type() -> String {
    "CAUSAL_LM".into()
}
fn default_peft_type() -> String {
    "LORA".into()
}

impl AdapterConfig {
    /// Build from run settings.
    #[must_use]
    pub fn new(base_model: &str, settings: &LoraSettings) -> Self {
        Self {
            base_model_name_or_path: base_model.to_string(),
            r: settings.r,
            lora_alpha: settings.alpha,
            lora_dropout: settings.dropout,
            target_modules: settings.target_modules.clone(),
            bias: default_bias(),
            task_type: default_task_type(),
            peft_type: default_peft_type(),
        }
    }

    /// `lora_alpha / r`.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.lora_alpha as f64 / self.r as f64
    }

    /// Read `adapter_config.json` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or invalid.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(ADAPTER_CONFIG_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            TuneError::Checkpoint(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write `adapter_config.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let path = dir.as_ref().join(ADAPTER_CONFIG_FILE);
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Whether the projection at `module_path` carries an adapter.
///
/// Matches on the last path segment, so `q_proj` targets
/// `model.layers.3.self_attn.q_proj`.
#[must_use]
pub fn is_target(module_path: &str, target_modules: &[String]) -> bool {
    let name = module_path.rsplit('.').next().unwrap_or(module_path);
    target_modules.iter().any(|t| t == name || t == module_path)
}

/// Save adapter weights and config into `dir`.
///
/// # Errors
///
/// Returns an error if the directory or files cannot be written.
pub fn save_adapter<P: AsRef<Path>>(varmap: &VarMap, config: &AdapterConfig, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let tensors: HashMap<String, Tensor> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| TuneError::Other("adapter parameters lock poisoned".into()))?;
        data.iter()
            .map(|(name, var)| (format!("{PEFT_PREFIX}{name}"), var.as_tensor().clone()))
            .collect()
    };
    candle_core::safetensors::save(&tensors, dir.join(ADAPTER_WEIGHTS_FILE))?;
    config.save(dir)?;

    tracing::debug!("Saved {} adapter tensors to {}", tensors.len(), dir.display());
    Ok(())
}

/// Load adapter weights from `dir` into the existing variables of `varmap`.
///
/// # Errors
///
/// Returns [`TuneError::Checkpoint`] if a variable has no stored value.
pub fn load_adapter<P: AsRef<Path>>(varmap: &VarMap, dir: P, device: &Device) -> Result<()> {
    let path = dir.as_ref().join(ADAPTER_WEIGHTS_FILE);
    let stored = candle_core::safetensors::load(&path, device)?;

    let data = varmap
        .data()
        .lock()
        .map_err(|_| TuneError::Other("adapter parameters lock poisoned".into()))?;
    for (name, var) in data.iter() {
        let tensor = stored
            .get(&format!("{PEFT_PREFIX}{name}"))
            .or_else(|| stored.get(name))
            .ok_or_else(|| {
                TuneError::Checkpoint(format!("{name} missing from {}", path.display()))
            })?;
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }

    tracing::info!("Loaded {} adapter tensors from {}", data.len(), path.display());
    Ok(())
}

/// Read adapter matrices from `dir`, keyed by module path.
///
/// # Errors
///
/// Returns an error if the file is unreadable or a module lacks `A` or `B`.
pub fn read_adapter_weights<P: AsRef<Path>>(
    dir: P,
    device: &Device,
) -> Result<HashMap<String, (Tensor, Tensor)>> {
    let path = dir.as_ref().join(ADAPTER_WEIGHTS_FILE);
    let stored = candle_core::safetensors::load(&path, device)?;

    let mut a_mats = HashMap::new();
    let mut b_mats = HashMap::new();
    for (name, tensor) in stored {
        let name = name.strip_prefix(PEFT_PREFIX).unwrap_or(&name);
        if let Some(module) = name.strip_suffix(".lora_A.weight") {
            a_mats.insert(module.to_string(), tensor);
        } else if let Some(module) = name.strip_suffix(".lora_B.weight") {
            b_mats.insert(module.to_string(), tensor);
        }
    }

    a_mats
        .into_iter()
        .map(|(module, a)| {
            let b = b_mats.remove(&module).ok_or_else(|| {
                TuneError::Checkpoint(format!("{module} has lora_A but no lora_B"))
            })?;
            Ok((module, (a, b)))
        })
        .collect()
}

/// Total number of trainable values in `varmap`.
#[must_use]
pub fn trainable_parameter_count(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// Log trainable versus total parameter counts.
pub fn print_trainable_parameters(trainable: usize, total: usize) {
    let pct = if total == 0 {
        0.0
    } else {
        100.0 * trainable as f64 / total as f64
    };
    tracing::info!(
        "trainable params: {trainable} || all params: {total} || trainable%: {pct:.4}"
    );
}
