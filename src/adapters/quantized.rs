//! Block-quantized frozen weights.

use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Device, Tensor};

use crate::config::QuantizationSettings;
use crate::error::Result;

/// GGML block format used for the given settings.
///
/// 4-bit uses `Q4_0`; with double quantization the `Q4K` super-block format
/// is used, whose per-block scales are themselves quantized. 8-bit uses
/// `Q8_0`.
#[must_use]
pub fn ggml_dtype(settings: &QuantizationSettings) -> GgmlDType {
    match (settings.bits, settings.double_quant) {
        (8, _) => GgmlDType::Q8_0,
        (_, true) => GgmlDType::Q4K,
        (_, false) => GgmlDType::Q4_0,
    }
}

/// A frozen 2D weight stored in a block-quantized format.
#[derive(Debug)]
pub struct QuantizedWeight {
    inner: QTensor,
    compute_dtype: DType,
}

impl QuantizedWeight {
    /// Quantize `weight`, or return `None` when its row length does not divide
    /// the format's block size.
    ///
    /// # Errors
    ///
    /// Returns an error if quantization fails for a compatible shape.
    pub fn quantize(weight: &Tensor, settings: &QuantizationSettings) -> Result<Option<Self>> {
        let dtype = ggml_dtype(settings);
        let in_features = weight.dim(candle_core::D::Minus1)?;
        if in_features % dtype.block_size() != 0 {
            return Ok(None);
        }
        let compute_dtype = weight.dtype();
        let inner = QTensor::quantize(weight, dtype)?;
        Ok(Some(Self {
            inner,
            compute_dtype,
        }))
    }

    /// Dequantize to the original dtype on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if dequantization fails.
    pub fn dequantize(&self, device: &Device) -> Result<Tensor> {
        Ok(self.inner.dequantize(device)?.to_dtype(self.compute_dtype)?)
    }

    /// Block format of the stored weight.
    #[must_use]
    pub fn format(&self) -> GgmlDType {
        self.inner.dtype()
    }

    /// Bytes held by the quantized storage.
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.inner.storage_size_in_bytes()
    }

    /// `(out_features, in_features)`.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        self.inner.shape().dims()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(bits: u8, double_quant: bool) -> QuantizationSettings {
        QuantizationSettings {
            bits,
            double_quant,
            ..Default::default()
        }
    }

    #[test]
    fn test_format_selection() {
        assert_eq!(ggml_dtype(&settings(4, false)), GgmlDType::Q4_0);
        assert_eq!(ggml_dtype(&settings(4, true)), GgmlDType::Q4K);
        assert_eq!(ggml_dtype(&settings(8, true)), GgmlDType::Q8_0);
    }

    #[test]
    fn test_quantize_reduces_memory() {
        let weight = Tensor::randn(0f32, 0.02, (64, 256), &Device::Cpu).unwrap();
        let q = QuantizedWeight::quantize(&weight, &settings(4, true))
            .unwrap()
            .unwrap();

        assert_eq!(q.dims(), &[64, 256]);
        assert!(q.size_in_bytes() * 4 < 64 * 256 * 4);
    }

    #[test]
    fn test_dequantize_is_close() {
        let weight = Tensor::randn(0f32, 0.02, (8, 64), &Device::Cpu).unwrap();
        let q = QuantizedWeight::quantize(&weight, &settings(8, false))
            .unwrap()
            .unwrap();
        let restored = q.dequantize(&Device::Cpu).unwrap();

        let err = (restored - &weight)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(err < 1e-3, "max abs error {err}");
    }

    #[test]
    fn test_incompatible_shape_is_skipped() {
        let weight = Tensor::zeros((4, 48), DType::F32, &Device::Cpu).unwrap();
        let q = QuantizedWeight::quantize(&weight, &settings(4, false)).unwrap();
        assert!(q.is_none());
    }
}
