//! Fold a trained adapter into the base weights.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::adapters::{read_adapter_weights, AdapterConfig};
use crate::error::{Result, TuneError};
use crate::model::{load_weights, resolve_model_path, save_tokenizer, TokenizerBundle};

/// Weights file written into the merged model directory.
pub const MERGED_WEIGHTS_FILE: &str = "model.safetensors";

/// Files copied verbatim from the base model directory.
const COPIED_MODEL_FILES: &[&str] = &["config.json", "generation_config.json"];

/// Merge the adapter in `adapter_dir` into `base_model` and write a
/// standalone model to `output_dir`.
///
/// Every adapted projection becomes `W + (alpha / r) · B·A`, computed in f32
/// and stored in the base weight's dtype. Returns the number of merged
/// projections.
///
/// # Errors
///
/// Returns an error if the base model or adapter cannot be read, an adapter
/// names a projection the base model lacks, or shapes disagree.
pub fn merge_adapter<P: AsRef<Path>, Q: AsRef<Path>>(
    base_model: &str,
    adapter_dir: P,
    output_dir: Q,
    tokenizer: &TokenizerBundle,
) -> Result<usize> {
    let adapter_dir = adapter_dir.as_ref();
    let output_dir = output_dir.as_ref();
    let device = Device::Cpu;

    tracing::info!("Merging adapter {} into {base_model}", adapter_dir.display());
    let model_path = resolve_model_path(base_model)?;
    let mut weights = load_weights(&model_path, &device)?;

    let adapter_config = AdapterConfig::from_dir(adapter_dir)?;
    let scale = adapter_config.scaling();
    let adapters = read_adapter_weights(adapter_dir, &device)?;
    if adapters.is_empty() {
        return Err(TuneError::Checkpoint(format!(
            "no adapter weights in {}",
            adapter_dir.display()
        )));
    }

    let mut modules: Vec<&String> = adapters.keys().collect();
    modules.sort();
    for module in &modules {
        let (a, b) = &adapters[*module];
        let name = format!("{module}.weight");
        let base = weights.get(&name).ok_or_else(|| {
            TuneError::Checkpoint(format!("adapter targets {name}, which the base model lacks"))
        })?;
        let merged = fold(base, a, b, scale)
            .map_err(|e| TuneError::Checkpoint(format!("cannot merge {name}: {e}")))?;
        weights.insert(name, merged);
    }

    std::fs::create_dir_all(output_dir)?;
    save_weights(&weights, &output_dir.join(MERGED_WEIGHTS_FILE))?;
    for file in COPIED_MODEL_FILES {
        let src = model_path.join(file);
        if src.exists() {
            std::fs::copy(&src, output_dir.join(file))?;
        }
    }
    save_tokenizer(tokenizer, output_dir)?;

    tracing::info!(
        "Merged {} projections (scale {scale}) into {}",
        modules.len(),
        output_dir.display()
    );
    Ok(modules.len())
}

/// `W + scale · B·A` in f32, cast back to `W`'s dtype.
fn fold(base: &Tensor, a: &Tensor, b: &Tensor, scale: f64) -> Result<Tensor> {
    let delta = (b.to_dtype(DType::F32)?.matmul(&a.to_dtype(DType::F32)?)? * scale)?;
    if delta.dims() != base.dims() {
        return Err(TuneError::Checkpoint(format!(
            "update shape {:?} does not match weight shape {:?}",
            delta.dims(),
            base.dims()
        )));
    }
    Ok((base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?)
}

/// Write `weights` with the `format: pt` metadata `transformers` expects.
fn save_weights(weights: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
    let mut sorted: Vec<(&String, &Tensor)> = weights.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    safetensors::serialize_to_file(sorted, Some(metadata), path)
        .map_err(|e| TuneError::Model(format!("cannot write {}: {e}", path.display())))
}
