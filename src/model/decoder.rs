//! Decoder-only transformer whose projections are [`LoraLinear`] layers.
//!
//! Covers the StableLM layout (LayerNorm, partial rotary embedding, optional
//! qkv bias) and the Llama layout (RmsNorm, full rotary embedding). All ops
//! used here have backward passes so gradients reach the adapters.

use std::cell::RefCell;
use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, VarMap};
use rand::rngs::StdRng;

use super::{ModelConfig, ModelFamily};
use crate::adapters::{is_target, LoraAdapter, LoraLinear};
use crate::config::{LoraSettings, QuantizationSettings};
use crate::error::{Result, TuneError};

/// Additive mask value for blocked attention positions.
const MASK_VALUE: f32 = -1e9;

/// Where projection weights and adapters come from.
pub(crate) struct LayerSource<'a> {
    pub weights: &'a HashMap<String, Tensor>,
    pub dtype: DType,
    pub device: &'a Device,
    pub lora: Option<(&'a LoraSettings, &'a VarMap)>,
    pub quant: Option<&'a QuantizationSettings>,
    /// Draws `lora_A` values in load order.
    pub rng: RefCell<StdRng>,
}

impl LayerSource<'_> {
    fn tensor(&self, name: &str) -> Result<Tensor> {
        let t = self
            .weights
            .get(name)
            .ok_or_else(|| TuneError::Model(format!("missing weight: {name}")))?;
        Ok(t.to_device(self.device)?.to_dtype(self.dtype)?)
    }

    fn projection(&self, path: &str, bias: bool) -> Result<LoraLinear> {
        let weight = self.tensor(&format!("{path}.weight"))?;
        let bias = if bias {
            Some(self.tensor(&format!("{path}.bias"))?)
        } else {
            None
        };
        let (out_features, in_features) = weight.dims2()?;

        let adapter = match self.lora {
            Some((settings, varmap)) if is_target(path, &settings.target_modules) => {
                Some(LoraAdapter::new(
                    in_features,
                    out_features,
                    settings,
                    varmap,
                    path,
                    self.device,
                    &mut self.rng.borrow_mut(),
                )?)
            }
            _ => None,
        };

        LoraLinear::new(weight, bias, self.quant, adapter)
    }
}

#[derive(Debug)]
enum Norm {
    Layer { weight: Tensor, bias: Tensor, eps: f32 },
    Rms { weight: Tensor, eps: f32 },
}

impl Norm {
    fn load(src: &LayerSource, path: &str, cfg: &ModelConfig) -> Result<Self> {
        let weight = src.tensor(&format!("{path}.weight"))?;
        Ok(match cfg.family()? {
            ModelFamily::StableLm => Self::Layer {
                weight,
                bias: src.tensor(&format!("{path}.bias"))?,
                eps: cfg.norm_eps() as f32,
            },
            ModelFamily::Llama => Self::Rms {
                weight,
                eps: cfg.norm_eps() as f32,
            },
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Layer { weight, bias, eps } => {
                candle_nn::ops::layer_norm_slow(xs, weight, bias, *eps)?
            }
            Self::Rms { weight, eps } => candle_nn::ops::rms_norm_slow(xs, weight, *eps)?,
        })
    }
}

#[derive(Debug)]
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(cfg: &ModelConfig, dtype: DType, device: &Device) -> Result<Self> {
        let dim = cfg.rotary_ndims();
        let max_seq_len = cfg.max_position_embeddings;
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / cfg.rope_theta.powf(i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::rotary_emb::rope_slow(xs, &self.cos, &self.sin)?)
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rotary_ndims: usize,
}

impl Attention {
    fn load(src: &LayerSource, path: &str, cfg: &ModelConfig) -> Result<Self> {
        let bias = cfg.qkv_bias();
        Ok(Self {
            q_proj: src.projection(&format!("{path}.q_proj"), bias)?,
            k_proj: src.projection(&format!("{path}.k_proj"), bias)?,
            v_proj: src.projection(&format!("{path}.v_proj"), bias)?,
            o_proj: src.projection(&format!("{path}.o_proj"), false)?,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_kv_heads(),
            head_dim: cfg.head_dim(),
            rotary_ndims: cfg.rotary_ndims(),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        mask: &Tensor,
        rotary: &RotaryEmbedding,
        train: bool,
    ) -> Result<Tensor> {
        let (b_sz, seq_len, hidden) = xs.dims3()?;

        let q = self
            .q_proj
            .forward(xs, train)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(xs, train)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(xs, train)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.apply_rotary(&q, rotary)?;
        let k = self.apply_rotary(&k, rotary)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1f64 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?
            .to_dtype(DType::F32)?
            .broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, hidden))?;
        self.o_proj.forward(&out, train)
    }

    fn apply_rotary(&self, xs: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        if self.rotary_ndims == self.head_dim {
            return rotary.apply(&xs.contiguous()?);
        }
        let pass = self.head_dim - self.rotary_ndims;
        let rot = xs.narrow(D::Minus1, 0, self.rotary_ndims)?.contiguous()?;
        let rest = xs.narrow(D::Minus1, self.rotary_ndims, pass)?;
        let rot = rotary.apply(&rot)?;
        Ok(Tensor::cat(&[&rot, &rest], D::Minus1)?.contiguous()?)
    }
}

#[derive(Debug)]
struct Mlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl Mlp {
    fn load(src: &LayerSource, path: &str) -> Result<Self> {
        Ok(Self {
            gate_proj: src.projection(&format!("{path}.gate_proj"), false)?,
            up_proj: src.projection(&format!("{path}.up_proj"), false)?,
            down_proj: src.projection(&format!("{path}.down_proj"), false)?,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let gate = self.gate_proj.forward(xs, train)?.silu()?;
        let up = self.up_proj.forward(xs, train)?;
        self.down_proj.forward(&(gate * up)?, train)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: Norm,
    post_attention_layernorm: Norm,
}

impl DecoderLayer {
    fn load(src: &LayerSource, path: &str, cfg: &ModelConfig) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(src, &format!("{path}.self_attn"), cfg)?,
            mlp: Mlp::load(src, &format!("{path}.mlp"))?,
            input_layernorm: Norm::load(src, &format!("{path}.input_layernorm"), cfg)?,
            post_attention_layernorm: Norm::load(
                src,
                &format!("{path}.post_attention_layernorm"),
                cfg,
            )?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        mask: &Tensor,
        rotary: &RotaryEmbedding,
        train: bool,
    ) -> Result<Tensor> {
        let residual = xs;
        let h = self.input_layernorm.forward(xs)?;
        let h = self.self_attn.forward(&h, mask, rotary, train)?;
        let xs = (h + residual)?;
        let h = self.post_attention_layernorm.forward(&xs)?;
        let h = self.mlp.forward(&h, train)?;
        Ok((xs + h)?)
    }
}

/// Causal language model with adapter-aware projections.
#[derive(Debug)]
pub struct CausalLm {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: Norm,
    lm_head: LoraLinear,
    rotary: RotaryEmbedding,
    max_position_embeddings: usize,
    device: Device,
    dtype: DType,
}

impl CausalLm {
    pub(crate) fn load(cfg: &ModelConfig, src: &LayerSource) -> Result<Self> {
        let embed_weight = src.tensor("model.embed_tokens.weight")?;
        let embed_tokens = Embedding::new(embed_weight.clone(), cfg.hidden_size);

        let layers = (0..cfg.num_hidden_layers)
            .map(|i| DecoderLayer::load(src, &format!("model.layers.{i}"), cfg))
            .collect::<Result<Vec<_>>>()?;

        let norm = Norm::load(src, "model.norm", cfg)?;

        // The output head stays full precision and untouched by adapters.
        let lm_head_weight = if src.weights.contains_key("lm_head.weight") {
            src.tensor("lm_head.weight")?
        } else if cfg.tie_word_embeddings {
            embed_weight
        } else {
            return Err(TuneError::Model("missing weight: lm_head.weight".into()));
        };
        let lm_head = LoraLinear::new(lm_head_weight, None, None, None)?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary: RotaryEmbedding::new(cfg, src.dtype, src.device)?,
            max_position_embeddings: cfg.max_position_embeddings,
            device: src.device.clone(),
            dtype: src.dtype,
        })
    }

    /// Logits `(batch, seq, vocab)` for `input_ids` `(batch, seq)`.
    ///
    /// `attention_mask` marks real tokens with 1 and padding with 0; padded
    /// keys are hidden from every query in addition to the causal mask.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence is longer than the rotary table or a
    /// tensor operation fails.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (b_sz, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_position_embeddings {
            return Err(TuneError::Model(format!(
                "sequence length {seq_len} exceeds max_position_embeddings {}",
                self.max_position_embeddings
            )));
        }
        let mask = self.attention_bias(b_sz, seq_len, attention_mask)?;

        let mut xs = self.embed_tokens.forward(input_ids)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &mask, &self.rotary, train)?;
        }
        let xs = self.norm.forward(&xs)?;
        self.lm_head.forward(&xs, train)
    }

    /// Additive `(batch, 1, seq, seq)` F32 bias combining causal and padding masks.
    fn attention_bias(
        &self,
        b_sz: usize,
        seq_len: usize,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let padding = match attention_mask {
            Some(mask) => mask.to_dtype(DType::U32)?.to_vec2::<u32>()?,
            None => vec![vec![1; seq_len]; b_sz],
        };

        let mut bias = Vec::with_capacity(b_sz * seq_len * seq_len);
        for row in &padding {
            for i in 0..seq_len {
                for (j, &keep) in row.iter().enumerate() {
                    bias.push(if j <= i && keep != 0 { 0f32 } else { MASK_VALUE });
                }
            }
        }
        Ok(Tensor::from_vec(bias, (b_sz, 1, seq_len, seq_len), &self.device)?)
    }

    /// All projections, in layer order, with their module paths.
    pub(crate) fn projections(&self) -> Vec<(String, &LoraLinear)> {
        let mut out = Vec::with_capacity(self.layers.len() * 7);
        for (i, layer) in self.layers.iter().enumerate() {
            let attn = &layer.self_attn;
            let mlp = &layer.mlp;
            for (name, proj) in [
                ("self_attn.q_proj", &attn.q_proj),
                ("self_attn.k_proj", &attn.k_proj),
                ("self_attn.v_proj", &attn.v_proj),
                ("self_attn.o_proj", &attn.o_proj),
                ("mlp.gate_proj", &mlp.gate_proj),
                ("mlp.up_proj", &mlp.up_proj),
                ("mlp.down_proj", &mlp.down_proj),
            ] {
                out.push((format!("model.layers.{i}.{name}"), proj));
            }
        }
        out
    }

    /// Number of frozen values (embeddings, norms and projections).
    #[must_use]
    pub fn num_frozen_parameters(&self) -> usize {
        let norm_params = |n: &Norm| match n {
            Norm::Layer { weight, bias, .. } => weight.elem_count() + bias.elem_count(),
            Norm::Rms { weight, .. } => weight.elem_count(),
        };
        let mut total = self.embed_tokens.embeddings().elem_count()
            + norm_params(&self.norm)
            + self.lm_head.num_frozen_parameters();
        for layer in &self.layers {
            total += norm_params(&layer.input_layernorm) + norm_params(&layer.post_attention_layernorm);
        }
        total
            + self
                .projections()
                .iter()
                .map(|(_, p)| p.num_frozen_parameters())
                .sum::<usize>()
    }

    /// Number of projections stored quantized.
    #[must_use]
    pub fn num_quantized_projections(&self) -> usize {
        self.projections()
            .iter()
            .filter(|(_, p)| p.is_quantized())
            .count()
    }

    /// Compute device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Compute dtype of the frozen weights.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
