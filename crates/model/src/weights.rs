//! Named weight providers.
//!
//! Tensors are addressed as `blk.{layer}.{name}.weight` for per-layer weights
//! and `{name}.weight` for the global ones. Providers hand projections to the
//! model as `(in, out)` so layers can right-multiply; checkpoints store them
//! as `(out, in)` and are transposed on the way in.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use std::sync::Mutex;

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};

use crate::errors::{ModelError, Result};

/// Every tensor a Llama decoder reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightName {
    TokenEmbd,
    AttnQ,
    AttnK,
    AttnV,
    AttnOutput,
    AttnNorm,
    FfnGate,
    FfnDown,
    FfnUp,
    FfnNorm,
    OutputNorm,
    Output,
}

impl WeightName {
    pub const ALL: [WeightName; 12] = [
        WeightName::TokenEmbd,
        WeightName::AttnQ,
        WeightName::AttnK,
        WeightName::AttnV,
        WeightName::AttnOutput,
        WeightName::AttnNorm,
        WeightName::FfnGate,
        WeightName::FfnDown,
        WeightName::FfnUp,
        WeightName::FfnNorm,
        WeightName::OutputNorm,
        WeightName::Output,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WeightName::TokenEmbd => "token_embd",
            WeightName::AttnQ => "attn_q",
            WeightName::AttnK => "attn_k",
            WeightName::AttnV => "attn_v",
            WeightName::AttnOutput => "attn_output",
            WeightName::AttnNorm => "attn_norm",
            WeightName::FfnGate => "ffn_gate",
            WeightName::FfnDown => "ffn_down",
            WeightName::FfnUp => "ffn_up",
            WeightName::FfnNorm => "ffn_norm",
            WeightName::OutputNorm => "output_norm",
            WeightName::Output => "output",
        }
    }

    /// Weights that live under `blk.{layer}`.
    pub fn is_per_layer(self) -> bool {
        !matches!(
            self,
            WeightName::TokenEmbd | WeightName::OutputNorm | WeightName::Output
        )
    }

    /// Dense matrices stored `(out, in)` in checkpoints.
    pub fn is_projection(self) -> bool {
        matches!(
            self,
            WeightName::AttnQ
                | WeightName::AttnK
                | WeightName::AttnV
                | WeightName::AttnOutput
                | WeightName::FfnGate
                | WeightName::FfnDown
                | WeightName::FfnUp
                | WeightName::Output
        )
    }

    /// Tensor key for this weight, or `None` when `layer` does not fit the
    /// weight's scope.
    pub fn key(self, layer: Option<usize>) -> Option<String> {
        match (self.is_per_layer(), layer) {
            (true, Some(layer)) => Some(format!("blk.{layer}.{}.weight", self.as_str())),
            (false, None) => Some(format!("{}.weight", self.as_str())),
            _ => None,
        }
    }

    /// Inverse of [`WeightName::key`].
    pub fn parse_key(key: &str) -> Option<(WeightName, Option<usize>)> {
        let stem = key.strip_suffix(".weight")?;
        let (layer, name) = match stem.strip_prefix("blk.") {
            Some(rest) => {
                let (layer, name) = rest.split_once('.')?;
                (Some(layer.parse().ok()?), name)
            }
            None => (None, stem),
        };
        let weight = Self::ALL.into_iter().find(|w| w.as_str() == name)?;
        weight.key(layer).map(|_| (weight, layer))
    }

    fn missing(self, layer: Option<usize>) -> ModelError {
        ModelError::MissingWeight {
            name: self.as_str().to_string(),
            layer,
        }
    }
}

impl fmt::Display for WeightName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only access to model weights.
///
/// Implementations are deterministic: the same request yields the same tensor.
/// Projections come back as `(in, out)`, `token_embd` as `(vocab, dims)` and
/// norms as `(dims,)`, all cast to `dtype`.
pub trait WeightSource {
    fn get(&self, name: WeightName, layer: Option<usize>, dtype: DType) -> Result<Tensor>;
}

/// In-memory weights keyed by tensor name, already in model layout.
#[derive(Debug, Clone, Default)]
pub struct TensorMapWeights {
    tensors: HashMap<String, Tensor>,
}

impl TensorMapWeights {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Load a safetensors checkpoint whose projections are stored `(out, in)`.
    pub fn from_safetensors(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let raw = candle_core::safetensors::load(path, device)?;
        let mut tensors = HashMap::with_capacity(raw.len());
        for (key, tensor) in raw {
            let tensor = match WeightName::parse_key(&key) {
                Some((name, _)) if name.is_projection() => tensor.t()?.contiguous()?,
                _ => tensor,
            };
            tensors.insert(key, tensor);
        }
        log::info!("loaded {} tensors from {}", tensors.len(), path.display());
        Ok(Self { tensors })
    }

    /// Insert a tensor in model layout.
    pub fn insert(&mut self, name: WeightName, layer: Option<usize>, tensor: Tensor) -> Result<()> {
        let key = name.key(layer).ok_or_else(|| name.missing(layer))?;
        self.tensors.insert(key, tensor);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightSource for TensorMapWeights {
    fn get(&self, name: WeightName, layer: Option<usize>, dtype: DType) -> Result<Tensor> {
        let key = name.key(layer).ok_or_else(|| name.missing(layer))?;
        let tensor = self.tensors.get(&key).ok_or_else(|| name.missing(layer))?;
        Ok(tensor.to_dtype(dtype)?)
    }
}

/// Weights read lazily from a GGUF file and dequantised on request.
pub struct GgufWeights<R: Read + Seek> {
    content: gguf_file::Content,
    reader: Mutex<R>,
    device: Device,
}

impl GgufWeights<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let content = gguf_file::Content::read(&mut reader)?;
        log::info!(
            "opened {} ({} tensors, {} metadata keys)",
            path.display(),
            content.tensor_infos.len(),
            content.metadata.len()
        );
        Ok(Self::new(content, reader, device.clone()))
    }
}

impl<R: Read + Seek> GgufWeights<R> {
    pub fn new(content: gguf_file::Content, reader: R, device: Device) -> Self {
        Self {
            content,
            reader: Mutex::new(reader),
            device,
        }
    }

    pub fn metadata(&self) -> &HashMap<String, gguf_file::Value> {
        &self.content.metadata
    }
}

impl<R: Read + Seek> fmt::Debug for GgufWeights<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GgufWeights")
            .field("tensors", &self.content.tensor_infos.len())
            .field("device", &self.device)
            .finish()
    }
}

impl<R: Read + Seek> WeightSource for GgufWeights<R> {
    fn get(&self, name: WeightName, layer: Option<usize>, dtype: DType) -> Result<Tensor> {
        let key = name.key(layer).ok_or_else(|| name.missing(layer))?;
        if !self.content.tensor_infos.contains_key(&key) {
            return Err(name.missing(layer));
        }
        let qtensor = {
            let mut reader = self
                .reader
                .lock()
                .map_err(|_| ModelError::Io(std::io::Error::other("gguf reader lock poisoned")))?;
            self.content.tensor(&mut *reader, &key, &self.device)?
        };
        let tensor = qtensor.dequantize(&self.device)?;
        let tensor = if name.is_projection() {
            tensor.t()?.contiguous()?
        } else {
            tensor
        };
        log::debug!("gguf {key} {:?} -> {:?}", tensor.dims(), dtype);
        Ok(tensor.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_block_scheme() {
        assert_eq!(
            WeightName::AttnQ.key(Some(3)).as_deref(),
            Some("blk.3.attn_q.weight")
        );
        assert_eq!(
            WeightName::OutputNorm.key(None).as_deref(),
            Some("output_norm.weight")
        );
        assert_eq!(WeightName::FfnUp.key(None), None);
        assert_eq!(WeightName::Output.key(Some(0)), None);
    }

    #[test]
    fn parse_key_inverts_key() {
        for name in WeightName::ALL {
            let layer = name.is_per_layer().then_some(7);
            let key = name.key(layer).unwrap();
            assert_eq!(WeightName::parse_key(&key), Some((name, layer)));
        }
        assert_eq!(WeightName::parse_key("blk.x.attn_q.weight"), None);
        assert_eq!(WeightName::parse_key("rope_freqs.weight"), None);
    }

    #[test]
    fn map_source_casts_and_reports_missing() -> Result<()> {
        let mut weights = TensorMapWeights::default();
        let norm = Tensor::ones(4, DType::F32, &Device::Cpu)?;
        weights.insert(WeightName::AttnNorm, Some(0), norm)?;

        let got = weights.get(WeightName::AttnNorm, Some(0), DType::F16)?;
        assert_eq!(got.dtype(), DType::F16);

        match weights.get(WeightName::AttnNorm, Some(1), DType::F32) {
            Err(ModelError::MissingWeight { name, layer }) => {
                assert_eq!(name, "attn_norm");
                assert_eq!(layer, Some(1));
            }
            other => panic!("expected MissingWeight, got {other:?}"),
        }
        assert!(weights.insert(WeightName::Output, Some(0), got).is_err());
        Ok(())
    }
}
