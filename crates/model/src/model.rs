use attention::kv_cache::{self, CacheLayout};
use attention::RopeAdapter;
use candle_core::{DType, Device, Tensor};
use embedding::positional::rope::{RopeKernel, RopeTable};
use embedding::token::TokenEmbedding;
use layers::{dtypes, Linear, NormConfig, RmsNorm};

use crate::block::TransformerBlock;
use crate::config::{HyperParams, RuntimeConfig};
use crate::errors::{ModelError, Result};
use crate::weights::{WeightName, WeightSource};

/// Key and value caches shaped `(cache_len, n_layers, 1, n_kv_heads, head_dim)`.
#[derive(Debug, Clone)]
pub struct KvCache {
    keys: Tensor,
    values: Tensor,
}

impl KvCache {
    pub fn new(keys: Tensor, values: Tensor) -> Self {
        Self { keys, values }
    }

    /// A zero-length cache for a fresh generation session.
    pub fn empty(params: &HyperParams, dtype: DType, device: &Device) -> Result<Self> {
        let layout = cache_layout(params);
        Ok(Self {
            keys: layout.empty(dtype, device)?,
            values: layout.empty(dtype, device)?,
        })
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.keys.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn into_parts(self) -> (Tensor, Tensor) {
        (self.keys, self.values)
    }
}

fn cache_layout(params: &HyperParams) -> CacheLayout {
    CacheLayout::new(params.n_layers, 1, params.n_kv_heads, params.head_dim)
}

/// Llama decoder: embedding, an ordered stack of blocks, final norm and the
/// output projection.
#[derive(Debug)]
pub struct Transformer {
    params: HyperParams,
    dtype: DType,
    device: Device,
    rope_kernel: RopeKernel,
    embedding: TokenEmbedding,
    blocks: Vec<TransformerBlock>,
    norm: RmsNorm,
    output: Linear,
    rope: RopeTable,
    layout: CacheLayout,
}

impl Transformer {
    /// Assemble the model from `source`.
    pub fn load(
        params: HyperParams,
        runtime: &RuntimeConfig,
        source: &dyn WeightSource,
    ) -> Result<Self> {
        params.validate()?;
        let dtype = runtime.dtype;
        if !dtypes::is_float(dtype) {
            return Err(ModelError::Config(format!(
                "model dtype must be floating point, got {dtype:?}"
            )));
        }

        let embedding_weight = source.get(WeightName::TokenEmbd, None, dtype)?;
        if embedding_weight.dims() != [params.vocab_size, params.dims] {
            return Err(ModelError::Config(format!(
                "token_embd expected ({}, {}), got {:?}",
                params.vocab_size,
                params.dims,
                embedding_weight.dims()
            )));
        }
        let embedding = TokenEmbedding::new(embedding_weight)
            .map_err(|e| ModelError::Config(e.to_string()))?;

        let rotary = runtime.rope_kernel.build();
        let blocks = (0..params.n_layers)
            .map(|layer| {
                TransformerBlock::load(
                    layer,
                    &params,
                    source,
                    dtype,
                    RopeAdapter::new(rotary.clone()),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let norm = RmsNorm::new(
            source.get(WeightName::OutputNorm, None, DType::F32)?,
            NormConfig::new(params.dims).with_epsilon(params.norm_eps),
        )
        .map_err(|e| ModelError::Config(format!("output_norm: {e}")))?;
        let output = Linear::with_shape(
            "output",
            source.get(WeightName::Output, None, dtype)?,
            params.dims,
            params.vocab_size,
        )
        .map_err(|e| ModelError::Config(e.to_string()))?;

        let rope = RopeTable::new(params.rope_config(), &runtime.device)
            .map_err(|e| ModelError::Config(e.to_string()))?;

        log::info!(
            "llama model built: dims={} layers={} heads={} kv_heads={} vocab={} dtype={:?} rope={}",
            params.dims,
            params.n_layers,
            params.n_heads,
            params.n_kv_heads,
            params.vocab_size,
            dtype,
            rotary.name()
        );

        Ok(Self {
            layout: cache_layout(&params),
            params,
            dtype,
            device: runtime.device.clone(),
            rope_kernel: runtime.rope_kernel,
            embedding,
            blocks,
            norm,
            output,
            rope,
        })
    }

    pub fn params(&self) -> &HyperParams {
        &self.params
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn rope_kernel(&self) -> RopeKernel {
        self.rope_kernel
    }

    /// An empty cache matching this model.
    pub fn empty_cache(&self) -> Result<KvCache> {
        KvCache::empty(&self.params, self.dtype, &self.device)
    }

    /// Run `tokens` (`[1, seq_len]`) on top of the cached positions.
    ///
    /// Returns logits `(1, seq_len, vocab_size)` and the caches extended by
    /// `seq_len` positions. The inputs are left untouched.
    pub fn forward(
        &self,
        tokens: &Tensor,
        k_cache: &Tensor,
        v_cache: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let seq_len = self.check_tokens(tokens)?;
        let start_pos = self.check_caches(k_cache, v_cache)?;
        if start_pos + seq_len > self.params.max_seq_len {
            return Err(ModelError::SequenceOverflow {
                start_pos,
                seq_len,
                max_seq_len: self.params.max_seq_len,
            });
        }

        let mut hidden = self.embedding.forward(tokens)?;
        let freqs = self.rope.slice(start_pos, seq_len)?.to_dtype(self.dtype)?;

        let mut k_updates = Vec::with_capacity(self.blocks.len());
        let mut v_updates = Vec::with_capacity(self.blocks.len());
        for (layer, block) in self.blocks.iter().enumerate() {
            let k_slice = kv_cache::layer_slice(k_cache, layer)?;
            let v_slice = kv_cache::layer_slice(v_cache, layer)?;
            let (next, new_k, new_v) =
                block.forward(&hidden, start_pos, &freqs, &k_slice, &v_slice)?;
            hidden = next;
            k_updates.push(new_k);
            v_updates.push(new_v);
        }

        let logits = self.output.forward(&self.norm.forward(&hidden)?)?;
        let k_cache = kv_cache::append(k_cache, &kv_cache::stack_layers(&k_updates)?)?;
        let v_cache = kv_cache::append(v_cache, &kv_cache::stack_layers(&v_updates)?)?;
        Ok((logits, k_cache, v_cache))
    }

    fn check_tokens(&self, tokens: &Tensor) -> Result<usize> {
        let seq_len = match tokens.dims() {
            [1, seq_len] if *seq_len > 0 => *seq_len,
            dims => {
                return Err(ModelError::Shape(format!(
                    "tokens must be [1, seq_len > 0], got {:?}",
                    dims
                )))
            }
        };
        if !tokens.dtype().is_int() {
            return Err(ModelError::Shape(format!(
                "tokens must have an integer dtype, got {:?}",
                tokens.dtype()
            )));
        }
        let ids = tokens.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        let vocab = self.params.vocab_size;
        if let Some(bad) = ids.iter().find(|&&id| id < 0 || id as usize >= vocab) {
            return Err(ModelError::Shape(format!(
                "token id {bad} outside vocabulary of {vocab}"
            )));
        }
        Ok(seq_len)
    }

    fn check_caches(&self, k_cache: &Tensor, v_cache: &Tensor) -> Result<usize> {
        let k_len = self
            .layout
            .validate("k_cache", k_cache)
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let v_len = self
            .layout
            .validate("v_cache", v_cache)
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        if k_len != v_len {
            return Err(ModelError::Shape(format!(
                "k_cache holds {k_len} positions but v_cache holds {v_len}"
            )));
        }
        for (name, cache) in [("k_cache", k_cache), ("v_cache", v_cache)] {
            if cache.dtype() != self.dtype {
                return Err(ModelError::Shape(format!(
                    "{name} dtype {:?} does not match model dtype {:?}",
                    cache.dtype(),
                    self.dtype
                )));
            }
        }
        Ok(k_len)
    }
}
