//! Linear projection with a frozen base weight and an optional `LoRA` update.

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Init, Linear, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::Rng;

use super::quantized::QuantizedWeight;
use crate::config::{LoraSettings, QuantizationSettings};
use crate::error::{Result, TuneError};

/// Trainable low-rank pair `A (r × in)`, `B (out × r)`.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    a: Tensor,
    b: Tensor,
    scale: f64,
    dropout: f32,
}

impl LoraAdapter {
    /// Create the pair under `prefix` in `varmap`, registering
    /// `lora_A.weight` and `lora_B.weight`.
    ///
    /// `A` is Kaiming-uniform with `a = sqrt(5)`, i.e. `U(-1/sqrt(in), 1/sqrt(in))`,
    /// drawn from `rng` so a fixed seed gives a fixed starting point. `B`
    /// starts at zero so the layer initially equals its base.
    ///
    /// # Errors
    ///
    /// Returns an error if the variables cannot be created.
    pub fn new(
        in_features: usize,
        out_features: usize,
        settings: &LoraSettings,
        varmap: &VarMap,
        prefix: &str,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let bound = (1.0 / in_features as f64).sqrt() as f32;
        let values: Vec<f32> = (0..settings.r * in_features)
            .map(|_| rng.gen_range(-bound..=bound))
            .collect();
        let a_init = Var::from_vec(values, (settings.r, in_features), device)?;
        varmap
            .data()
            .lock()
            .map_err(|_| TuneError::Other("adapter variable map lock poisoned".into()))?
            .insert(format!("{prefix}.lora_A.weight"), a_init);

        // VarMap hands back an existing variable instead of re-initializing it.
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device).pp(prefix);
        let a = vb.get((settings.r, in_features), "lora_A.weight")?;
        let b = vb.get_with_hints((out_features, settings.r), "lora_B.weight", Init::Const(0.))?;
        Ok(Self::from_tensors(a, b, settings.scaling(), settings.dropout as f32))
    }

    /// Wrap existing matrices, e.g. ones read back from an adapter file.
    #[must_use]
    pub fn from_tensors(a: Tensor, b: Tensor, scale: f64, dropout: f32) -> Self {
        Self {
            a,
            b,
            scale,
            dropout,
        }
    }

    /// Rank of the update.
    ///
    /// # Errors
    ///
    /// Returns an error if `A` is not two-dimensional.
    pub fn rank(&self) -> Result<usize> {
        Ok(self.a.dim(0)?)
    }

    /// `scale · B·A`, shaped like the base weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the matrix product fails.
    pub fn delta_weight(&self) -> Result<Tensor> {
        Ok((self.b.matmul(&self.a)? * self.scale)?)
    }

    /// `scale · B(A(dropout(x)))`, computed in the adapter dtype.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = xs.to_dtype(self.a.dtype())?;
        let xs = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&xs, self.dropout)?
        } else {
            xs
        };
        let h = Linear::new(self.a.clone(), None).forward(&xs)?;
        let h = Linear::new(self.b.clone(), None).forward(&h)?;
        Ok((h * self.scale)?)
    }

    /// Number of trainable values in `A` and `B`.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.a.elem_count() + self.b.elem_count()
    }
}

/// Frozen projection weight.
#[derive(Debug)]
pub enum FrozenWeight {
    /// Full-precision tensor.
    Full(Tensor),
    /// Block-quantized, dequantized on every forward pass.
    Quantized(QuantizedWeight),
}

/// `y = x·Wᵀ + bias + scale · B(A(x))`.
#[derive(Debug)]
pub struct LoraLinear {
    weight: FrozenWeight,
    bias: Option<Tensor>,
    adapter: Option<LoraAdapter>,
    device: Device,
    dtype: DType,
    in_features: usize,
    out_features: usize,
}

impl LoraLinear {
    /// Wrap a frozen weight, quantizing it when `quant` is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the weight is not 2D or quantization fails.
    pub fn new(
        weight: Tensor,
        bias: Option<Tensor>,
        quant: Option<&QuantizationSettings>,
        adapter: Option<LoraAdapter>,
    ) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        let device = weight.device().clone();
        let dtype = weight.dtype();

        let weight = match quant {
            Some(settings) => match QuantizedWeight::quantize(&weight, settings)? {
                Some(q) => FrozenWeight::Quantized(q),
                None => {
                    tracing::debug!(
                        "Keeping {out_features}x{in_features} weight in full precision (not block aligned)"
                    );
                    FrozenWeight::Full(weight)
                }
            },
            None => FrozenWeight::Full(weight),
        };

        Ok(Self {
            weight,
            bias,
            adapter,
            device,
            dtype,
            in_features,
            out_features,
        })
    }

    /// Base weight in the compute dtype.
    ///
    /// # Errors
    ///
    /// Returns an error if dequantization fails.
    pub fn base_weight(&self) -> Result<Tensor> {
        match &self.weight {
            FrozenWeight::Full(w) => Ok(w.clone()),
            FrozenWeight::Quantized(q) => q.dequantize(&self.device),
        }
    }

    /// Base weight with the adapter update folded in.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn merged_weight(&self) -> Result<Tensor> {
        let base = self.base_weight()?;
        match &self.adapter {
            Some(adapter) => {
                let delta = adapter.delta_weight()?.to_dtype(DType::F32)?;
                Ok((base.to_dtype(DType::F32)? + delta)?.to_dtype(self.dtype)?)
            }
            None => Ok(base),
        }
    }

    /// Forward pass. Dropout on the adapter input is active only when `train`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = Linear::new(self.base_weight()?, self.bias.clone()).forward(xs)?;
        match &self.adapter {
            Some(adapter) => {
                let update = adapter.forward(xs, train)?.to_dtype(out.dtype())?;
                Ok((out + update)?)
            }
            None => Ok(out),
        }
    }

    /// The adapter, if this projection is a target.
    #[must_use]
    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    /// Whether the base weight is stored quantized.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        matches!(self.weight, FrozenWeight::Quantized(_))
    }

    /// Input width.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output width.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Number of frozen values, bias included.
    #[must_use]
    pub fn num_frozen_parameters(&self) -> usize {
        self.in_features * self.out_features + self.bias.as_ref().map_or(0, Tensor::elem_count)
    }

    /// Bytes held by the frozen weight.
    #[must_use]
    pub fn frozen_size_in_bytes(&self) -> usize {
        match &self.weight {
            FrozenWeight::Full(w) => w.elem_count() * w.dtype().size_in_bytes(),
            FrozenWeight::Quantized(q) => q.size_in_bytes(),
        }
    }
}
