//! Rotary positional embeddings.
//!
//! The frequency table is an **f32** tensor shaped `[max_seq_len, head_dim/2, 2]`
//! where `[t, i, 0]` holds `cos(t * freq_i)` and `[t, i, 1]` holds
//! `sin(t * freq_i)`, with `freq_i = theta^(-2i/head_dim)`. Callers slice the
//! rows covering `[start_pos, start_pos + seq_len)` and cast them to the model
//! dtype before handing them to a [`RotaryKernel`].
//!
//! Kernels treat the last axis of `[batch, seq_len, n_heads, head_dim]` inputs
//! as interleaved `(re, im)` pairs and rotate each pair by its angle:
//! `re' = re*cos - im*sin`, `im' = re*sin + im*cos`.

use candle_core::{bail, Device, DeviceLocation, Result, Tensor};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

const TABLE_CACHE_CAPACITY: usize = 16;

static TABLE_CACHE_HITS: AtomicUsize = AtomicUsize::new(0);
static TABLE_CACHE_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Return the current `(hits, misses)` counters for the shared table cache.
pub fn table_cache_counters() -> (usize, usize) {
    (
        TABLE_CACHE_HITS.load(Ordering::Relaxed),
        TABLE_CACHE_MISSES.load(Ordering::Relaxed),
    )
}

struct TableCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, Tensor>,
}

impl TableCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key_owned = self.order.remove(pos);
            self.order.push(key_owned);
        }
    }

    fn get(&mut self, key: &str) -> Option<Tensor> {
        let value = self.entries.get(key)?.clone();
        self.touch(key);
        Some(value)
    }

    fn insert(&mut self, key: String, value: Tensor) {
        if self.entries.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }
        if self.order.len() >= self.capacity && !self.order.is_empty() {
            let evicted = self.order.remove(0);
            self.entries.remove(&evicted);
        }
        self.order.push(key);
    }
}

fn global_table_cache() -> &'static Mutex<TableCache> {
    static CACHE: OnceLock<Mutex<TableCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(TableCache::new(TABLE_CACHE_CAPACITY)))
}

/// Geometry of the rotary table.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality being rotated; must be even.
    pub head_dim: usize,
    /// Base angle parameter θ (Llama 2 uses 10k).
    pub rope_theta: f32,
    /// Number of positions covered by the table.
    pub max_seq_len: usize,
}

impl RopeConfig {
    pub fn new(head_dim: usize, rope_theta: f32, max_seq_len: usize) -> Self {
        Self {
            head_dim,
            rope_theta,
            max_seq_len,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 || self.head_dim % 2 != 0 {
            bail!("rope head_dim must be even and non-zero, got {}", self.head_dim);
        }
        if !(self.rope_theta > 0.0) {
            bail!("rope theta must be positive, got {}", self.rope_theta);
        }
        if self.max_seq_len == 0 {
            bail!("rope max_seq_len must be non-zero");
        }
        Ok(())
    }

    fn cache_key(&self, device: &Device) -> String {
        let device_id = match device.location() {
            DeviceLocation::Cpu => "cpu".to_owned(),
            DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
            DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
        };
        format!(
            "seq={};dim={};theta={:.6};dev={}",
            self.max_seq_len, self.head_dim, self.rope_theta, device_id
        )
    }
}

/// Build the `[max_len, head_dim/2, 2]` cos/sin table in f32.
///
/// Angles are accumulated in f64 before narrowing so long tables do not drift.
pub fn compute_table(
    max_len: usize,
    head_dim: usize,
    theta: f32,
    device: &Device,
) -> Result<Tensor> {
    RopeConfig::new(head_dim, theta, max_len).validate()?;

    let half_dim = head_dim / 2;
    let base = theta as f64;
    let inv_freqs: Vec<f64> = (0..half_dim)
        .map(|idx| base.powf(-((2 * idx) as f64) / head_dim as f64))
        .collect();

    let mut data = Vec::with_capacity(max_len * half_dim * 2);
    for pos in 0..max_len {
        let pos_f = pos as f64;
        for &inv_freq in &inv_freqs {
            let angle = pos_f * inv_freq;
            data.push(angle.cos() as f32);
            data.push(angle.sin() as f32);
        }
    }
    Tensor::from_vec(data, (max_len, half_dim, 2), device)
}

/// Negate the sine column so applying the result undoes a rotation.
pub fn invert_rotation(freqs: &Tensor) -> Result<Tensor> {
    let cos = freqs.narrow(2, 0, 1)?;
    let sin = freqs.narrow(2, 1, 1)?.neg()?;
    Tensor::cat(&[&cos, &sin], 2)
}

/// Precomputed rotary table shared read-only by every layer of a model.
#[derive(Debug, Clone)]
pub struct RopeTable {
    config: RopeConfig,
    table: Tensor,
}

impl RopeTable {
    /// Fetch (or build and remember) the table for `config` on `device`.
    pub fn new(config: RopeConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let key = config.cache_key(device);
        let cache = global_table_cache();
        {
            let mut guard = cache
                .lock()
                .map_err(|_| candle_core::Error::Msg("rope table cache poisoned".into()))?;
            if let Some(table) = guard.get(&key) {
                TABLE_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
                log::debug!("rope table cache hit: {}", key);
                return Ok(Self { config, table });
            }
        }
        TABLE_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
        log::debug!("rope table cache miss: {}", key);

        let table = compute_table(
            config.max_seq_len,
            config.head_dim,
            config.rope_theta,
            device,
        )?;
        let mut guard = cache
            .lock()
            .map_err(|_| candle_core::Error::Msg("rope table cache poisoned".into()))?;
        guard.insert(key, table.clone());
        Ok(Self { config, table })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    pub fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    /// The full f32 table.
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    /// Rows `[start_pos, start_pos + seq_len)`, still in f32. No wraparound.
    pub fn slice(&self, start_pos: usize, seq_len: usize) -> Result<Tensor> {
        let max_len = self.config.max_seq_len;
        if seq_len == 0 {
            bail!("rope slice requires seq_len > 0");
        }
        if start_pos + seq_len > max_len {
            bail!(
                "rope slice [{}, {}) exceeds table of {} positions",
                start_pos,
                start_pos + seq_len,
                max_len
            );
        }
        self.table.narrow(0, start_pos, seq_len)
    }
}

/// A rotation implementation applied to query/key tensors.
///
/// `x` is `[batch, seq_len, n_heads, head_dim]`; `freqs` is the
/// `[seq_len, head_dim/2, 2]` slice for the same positions. Output matches the
/// input shape and dtype.
pub trait RotaryKernel: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, x: &Tensor, freqs: &Tensor) -> Result<Tensor>;
}

fn check_geometry(x: &Tensor, freqs: &Tensor) -> Result<(usize, usize, usize, usize)> {
    let (batch, seq_len, heads, head_dim) = x.dims4()?;
    if head_dim % 2 != 0 {
        bail!("rotary input head_dim must be even, got {}", head_dim);
    }
    match freqs.dims() {
        [s, h, 2] if *s == seq_len && *h == head_dim / 2 => {}
        dims => bail!(
            "rotary freqs expected [{}, {}, 2] for input {:?}, got {:?}",
            seq_len,
            head_dim / 2,
            x.dims(),
            dims
        ),
    }
    Ok((batch, seq_len, heads, head_dim))
}

/// Explicit complex-multiply formulation built from elementwise tensor ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceRotary;

impl RotaryKernel for ReferenceRotary {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn apply(&self, x: &Tensor, freqs: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, heads, head_dim) = check_geometry(x, freqs)?;
        let half_dim = head_dim / 2;
        let freqs = freqs.to_dtype(x.dtype())?;

        let cos = freqs.narrow(2, 0, 1)?.reshape((1, seq_len, 1, half_dim, 1))?;
        let sin = freqs.narrow(2, 1, 1)?.reshape((1, seq_len, 1, half_dim, 1))?;

        let pairs = x.reshape((batch, seq_len, heads, half_dim, 2))?;
        let re = pairs.narrow(4, 0, 1)?;
        let im = pairs.narrow(4, 1, 1)?;

        let re_out = re.broadcast_mul(&cos)?.sub(&im.broadcast_mul(&sin)?)?;
        let im_out = re.broadcast_mul(&sin)?.add(&im.broadcast_mul(&cos)?)?;

        Tensor::cat(&[&re_out, &im_out], 4)?.reshape((batch, seq_len, heads, head_dim))
    }
}

/// Candle's interleaved rotary kernel (`rope_i`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FusedRotary;

impl RotaryKernel for FusedRotary {
    fn name(&self) -> &'static str {
        "fused"
    }

    fn apply(&self, x: &Tensor, freqs: &Tensor) -> Result<Tensor> {
        check_geometry(x, freqs)?;
        let freqs = freqs.to_dtype(x.dtype())?;
        let cos = freqs.narrow(2, 0, 1)?.squeeze(2)?.contiguous()?;
        let sin = freqs.narrow(2, 1, 1)?.squeeze(2)?.contiguous()?;

        // rope_i wants [batch, heads, seq, dim]
        let heads_major = x.transpose(1, 2)?.contiguous()?;
        let rotated = candle_nn::rotary_emb::rope_i(&heads_major, &cos, &sin)?;
        rotated.transpose(1, 2)?.contiguous()
    }
}

/// Configuration switch selecting a [`RotaryKernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RopeKernel {
    #[default]
    Reference,
    Fused,
}

impl RopeKernel {
    pub fn build(self) -> Arc<dyn RotaryKernel> {
        match self {
            RopeKernel::Reference => Arc::new(ReferenceRotary),
            RopeKernel::Fused => Arc::new(FusedRotary),
        }
    }
}

impl FromStr for RopeKernel {
    type Err = candle_core::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reference" | "ref" => Ok(RopeKernel::Reference),
            "fused" => Ok(RopeKernel::Fused),
            other => bail!("unknown rope kernel '{other}', expected reference|fused"),
        }
    }
}
