//! Head geometry shared by the attention module and its callers.

use super::AttentionError;

/// Static description of one attention layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionConfig {
    /// Model width of the incoming activations.
    pub hidden_dim: usize,
    /// Number of query heads.
    pub n_heads: usize,
    /// Number of key/value heads; divides `n_heads`.
    pub n_kv_heads: usize,
    /// Dimensionality per head.
    pub head_dim: usize,
}

impl AttentionConfig {
    pub fn new(hidden_dim: usize, n_heads: usize, n_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            hidden_dim,
            n_heads,
            n_kv_heads,
            head_dim,
        }
    }

    /// How many query heads share each key/value head.
    pub fn n_rep(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    pub fn q_dim(&self) -> usize {
        self.n_heads * self.head_dim
    }

    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.hidden_dim == 0 || self.n_heads == 0 || self.n_kv_heads == 0 || self.head_dim == 0 {
            return Err(AttentionError::Config(format!(
                "all dimensions must be non-zero: {:?}",
                self
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(AttentionError::Config(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim
            )));
        }
        if self.n_kv_heads > self.n_heads || self.n_heads % self.n_kv_heads != 0 {
            return Err(AttentionError::Config(format!(
                "n_heads ({}) must be a multiple of n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_query_geometry() {
        let cfg = AttentionConfig::new(64, 8, 2, 8);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.n_rep(), 4);
        assert_eq!(cfg.q_dim(), 64);
        assert_eq!(cfg.kv_dim(), 16);
    }

    #[test]
    fn rejects_uneven_grouping_and_odd_heads() {
        assert!(AttentionConfig::new(48, 6, 4, 8).validate().is_err());
        assert!(AttentionConfig::new(12, 4, 8, 3).validate().is_err());
        assert!(AttentionConfig::new(15, 3, 3, 5).validate().is_err());
        assert!(AttentionConfig::new(8, 2, 0, 4).validate().is_err());
    }
}
