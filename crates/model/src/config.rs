//! Model hyperparameters and runtime selection.

use std::collections::HashMap;
use std::path::Path;

use attention::AttentionConfig;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device};
use embedding::positional::rope::{RopeConfig, RopeKernel};
use serde::{Deserialize, Serialize};

use crate::errors::{ModelError, Result};

/// Immutable architecture description of a Llama-style decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub dims: usize,
    pub ffn_dim: usize,
    pub norm_eps: f64,
    pub vocab_size: usize,
    pub rope_theta: f32,
    pub max_seq_len: usize,
}

/// Field names of a Hugging Face `config.json` for Llama checkpoints.
#[derive(Debug, Deserialize)]
struct LlamaConfigJson {
    hidden_size: usize,
    intermediate_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    num_key_value_heads: Option<usize>,
    head_dim: Option<usize>,
    rms_norm_eps: f64,
    vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    rope_theta: f32,
    #[serde(default = "default_max_position_embeddings")]
    max_position_embeddings: usize,
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl From<LlamaConfigJson> for HyperParams {
    fn from(cfg: LlamaConfigJson) -> Self {
        let head_dim = cfg
            .head_dim
            .unwrap_or(cfg.hidden_size / cfg.num_attention_heads.max(1));
        Self {
            n_layers: cfg.num_hidden_layers,
            n_heads: cfg.num_attention_heads,
            n_kv_heads: cfg.num_key_value_heads.unwrap_or(cfg.num_attention_heads),
            head_dim,
            dims: cfg.hidden_size,
            ffn_dim: cfg.intermediate_size,
            norm_eps: cfg.rms_norm_eps,
            vocab_size: cfg.vocab_size,
            rope_theta: cfg.rope_theta,
            max_seq_len: cfg.max_position_embeddings,
        }
    }
}

impl HyperParams {
    /// Parse a Llama `config.json` document.
    pub fn from_llama_json(json: &str) -> Result<Self> {
        let raw: LlamaConfigJson = serde_json::from_str(json)?;
        let params = Self::from(raw);
        params.validate()?;
        Ok(params)
    }

    pub fn from_llama_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_llama_json(&json)
    }

    /// Read hyperparameters from the `llama.*` keys of a GGUF header.
    pub fn from_gguf_metadata(metadata: &HashMap<String, gguf_file::Value>) -> Result<Self> {
        let get = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| ModelError::Config(format!("cannot find {key} in GGUF metadata")))
        };
        let get_u32 = |key: &str| -> Result<usize> { Ok(get(key)?.to_u32()? as usize) };

        let n_heads = get_u32("llama.attention.head_count")?;
        let n_kv_heads = match metadata.get("llama.attention.head_count_kv") {
            Some(value) => value.to_u32()? as usize,
            None => n_heads,
        };
        let dims = get_u32("llama.embedding_length")?;
        let vocab_size = match metadata.get("llama.vocab_size") {
            Some(value) => value.to_u32()? as usize,
            None => get("tokenizer.ggml.tokens")?.to_vec()?.len(),
        };
        let rope_theta = match metadata.get("llama.rope.freq_base") {
            Some(value) => value.to_f32()?,
            None => default_rope_theta(),
        };

        let params = Self {
            n_layers: get_u32("llama.block_count")?,
            n_heads,
            n_kv_heads,
            head_dim: dims / n_heads.max(1),
            dims,
            ffn_dim: get_u32("llama.feed_forward_length")?,
            norm_eps: get("llama.attention.layer_norm_rms_epsilon")?.to_f32()? as f64,
            vocab_size,
            rope_theta,
            max_seq_len: get_u32("llama.context_length")?,
        };
        params.validate()?;
        Ok(params)
    }

    /// Validate structural invariants of the architecture.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("head_dim", self.head_dim),
            ("dims", self.dims),
            ("ffn_dim", self.ffn_dim),
            ("vocab_size", self.vocab_size),
            ("max_seq_len", self.max_seq_len),
        ] {
            if value == 0 {
                return Err(ModelError::Config(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.n_heads * self.head_dim != self.dims {
            return Err(ModelError::Config(format!(
                "dims ({}) must equal n_heads ({}) * head_dim ({})",
                self.dims, self.n_heads, self.head_dim
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(ModelError::Config(format!(
                "head_dim ({}) must be even",
                self.head_dim
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(ModelError::Config(format!(
                "n_heads ({}) must be a multiple of n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            )));
        }
        if !(self.norm_eps > 0.0) {
            return Err(ModelError::Config(format!(
                "norm_eps must be positive, got {}",
                self.norm_eps
            )));
        }
        if !(self.rope_theta > 0.0) {
            return Err(ModelError::Config(format!(
                "rope_theta must be positive, got {}",
                self.rope_theta
            )));
        }
        Ok(())
    }

    pub fn n_rep(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    pub fn attention_config(&self) -> AttentionConfig {
        AttentionConfig::new(self.dims, self.n_heads, self.n_kv_heads, self.head_dim)
    }

    pub fn rope_config(&self) -> RopeConfig {
        RopeConfig::new(self.head_dim, self.rope_theta, self.max_seq_len)
    }
}

/// Execution choices that do not change the architecture.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub dtype: DType,
    pub device: Device,
    pub rope_kernel: RopeKernel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dtype: DType::F32,
            device: Device::Cpu,
            rope_kernel: RopeKernel::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new(dtype: DType, device: Device) -> Self {
        Self {
            dtype,
            device,
            rope_kernel: RopeKernel::default(),
        }
    }

    pub fn with_rope_kernel(mut self, rope_kernel: RopeKernel) -> Self {
        self.rope_kernel = rope_kernel;
        self
    }

    /// Reads `ROPE_KERNEL`, `MODEL_DTYPE` and `CANDLE_FORCE_CPU`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RuntimeConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            device: select_device(lookup("CANDLE_FORCE_CPU").is_some())?,
            ..Self::default()
        };
        if let Some(kernel) = lookup("ROPE_KERNEL") {
            config.rope_kernel = kernel
                .parse()
                .map_err(|e: candle_core::Error| ModelError::Config(e.to_string()))?;
        }
        if let Some(dtype) = lookup("MODEL_DTYPE") {
            config.dtype = parse_dtype(&dtype)?;
        }
        Ok(config)
    }
}

/// CUDA when available, unless `force_cpu` is set.
pub fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    Ok(Device::cuda_if_available(0)?)
}

/// Parse a model dtype name; only floating point types are accepted.
pub fn parse_dtype(value: &str) -> Result<DType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "f64" | "float64" => Ok(DType::F64),
        other => Err(ModelError::Config(format!(
            "unsupported model dtype '{other}', expected f32|f16|bf16|f64"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> HyperParams {
        HyperParams {
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 4,
            dims: 16,
            ffn_dim: 32,
            norm_eps: 1e-5,
            vocab_size: 10,
            rope_theta: 10_000.0,
            max_seq_len: 32,
        }
    }

    #[test]
    fn parses_llama_config_json() {
        let json = r#"{
            "hidden_size": 4096,
            "intermediate_size": 11008,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "rms_norm_eps": 1e-6,
            "vocab_size": 32000,
            "max_position_embeddings": 4096,
            "torch_dtype": "float16"
        }"#;
        let params = HyperParams::from_llama_json(json).unwrap();
        assert_eq!(params.head_dim, 128);
        assert_eq!(params.n_kv_heads, 8);
        assert_eq!(params.n_rep(), 4);
        assert_eq!(params.rope_theta, 10_000.0);
        assert_eq!(params.ffn_dim, 11008);
    }

    #[test]
    fn round_trips_through_serde() {
        let params = tiny();
        let json = serde_json::to_string(&params).unwrap();
        let back: HyperParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn validate_rejects_broken_geometry() {
        let mut params = tiny();
        params.n_kv_heads = 3;
        assert!(matches!(params.validate(), Err(ModelError::Config(_))));

        let mut params = tiny();
        params.dims = 12;
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("n_heads"));

        let mut params = tiny();
        params.head_dim = 3;
        params.dims = 12;
        assert!(params.validate().is_err());

        let mut params = tiny();
        params.vocab_size = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn reads_gguf_metadata() {
        use gguf_file::Value;
        let mut md = HashMap::new();
        md.insert("llama.block_count".to_string(), Value::U32(2));
        md.insert("llama.attention.head_count".to_string(), Value::U32(4));
        md.insert("llama.attention.head_count_kv".to_string(), Value::U32(2));
        md.insert("llama.embedding_length".to_string(), Value::U32(16));
        md.insert("llama.feed_forward_length".to_string(), Value::U32(32));
        md.insert(
            "llama.attention.layer_norm_rms_epsilon".to_string(),
            Value::F32(1e-5),
        );
        md.insert("llama.context_length".to_string(), Value::U32(32));
        md.insert(
            "tokenizer.ggml.tokens".to_string(),
            Value::Array((0..10).map(|i| Value::String(format!("t{i}"))).collect()),
        );

        let params = HyperParams::from_gguf_metadata(&md).unwrap();
        assert_eq!(params.head_dim, 4);
        assert_eq!(params.vocab_size, 10);
        assert_eq!(params.rope_theta, 10_000.0);

        md.remove("llama.block_count");
        let err = HyperParams::from_gguf_metadata(&md).unwrap_err();
        assert!(err.to_string().contains("llama.block_count"));
    }

    #[test]
    fn runtime_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("ROPE_KERNEL", "fused"),
            ("MODEL_DTYPE", "bf16"),
            ("CANDLE_FORCE_CPU", "1"),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.rope_kernel, RopeKernel::Fused);
        assert_eq!(config.dtype, DType::BF16);
        assert!(config.device.is_cpu());

        let bad = RuntimeConfig::from_lookup(|k| (k == "MODEL_DTYPE").then(|| "u8".to_string()));
        assert!(matches!(bad, Err(ModelError::Config(_))));
    }
}
