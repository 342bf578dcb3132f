//! Multi-head attention for encoder-decoder transformers
//!
//! One attention type serves three roles: bidirectional self-attention
//! with a padding mask (encoder), causal self-attention (decoder), and
//! cross-attention over encoder output (decoder). Key/value head
//! projections are exposed separately from the attention computation so
//! callers can capture them as cache entries.
//!
//! # References
//!
//! "Attention is All You Need" - Vaswani et al., 2017

use serde::{Deserialize, Serialize};

use crate::error::{PortarError, Result};
use crate::ops;
use crate::tensor::Tensor;

use super::{softmax, Linear};

/// Multi-head attention with Q/K/V/output projections
///
/// Query scaling by `1/sqrt(d_k)` is applied to the projected queries
/// before the score matmul; the traced graph emits the same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiHeadAttention {
    /// Number of attention heads
    num_heads: usize,
    /// Per-head dimension (`d_model` / `num_heads`)
    head_dim: usize,
    /// Scale factor: 1 / `sqrt(head_dim)`
    scale: f32,
    /// Query projection
    q_proj: Linear,
    /// Key projection
    k_proj: Linear,
    /// Value projection
    v_proj: Linear,
    /// Output projection
    out_proj: Linear,
}

impl MultiHeadAttention {
    /// Assemble multi-head attention from its four projections
    ///
    /// # Errors
    ///
    /// Returns error if projection dimensions disagree or `d_model` is not
    /// divisible by `num_heads`.
    pub fn new(
        num_heads: usize,
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        out_proj: Linear,
    ) -> Result<Self> {
        if num_heads == 0 {
            return Err(PortarError::InvalidShape {
                reason: "num_heads must be > 0".to_string(),
            });
        }
        let d_model = q_proj.out_features();
        if k_proj.out_features() != d_model
            || v_proj.out_features() != d_model
            || out_proj.in_features() != d_model
        {
            return Err(PortarError::InvalidShape {
                reason: "Attention projection dimensions disagree".to_string(),
            });
        }
        if d_model % num_heads != 0 {
            return Err(PortarError::InvalidShape {
                reason: format!("d_model {d_model} not divisible by num_heads {num_heads}"),
            });
        }

        let head_dim = d_model / num_heads;
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (head_dim as f32).sqrt();

        Ok(Self {
            num_heads,
            head_dim,
            scale,
            q_proj,
            k_proj,
            v_proj,
            out_proj,
        })
    }

    /// Project a source tensor into per-head key and value tensors
    ///
    /// Input `[batch, seq, d_model]`; each output `[batch, heads, seq, d_k]`,
    /// the layout cache entries are exchanged in.
    ///
    /// # Errors
    ///
    /// Returns error on shape mismatch.
    pub fn project_kv(&self, source: &Tensor<f32>) -> Result<(Tensor<f32>, Tensor<f32>)> {
        let k = ops::split_heads(&self.k_proj.forward(source)?, self.num_heads)?;
        let v = ops::split_heads(&self.v_proj.forward(source)?, self.num_heads)?;
        Ok((k, v))
    }

    /// Attend pre-projected keys/values with queries derived from `query_src`
    ///
    /// * `query_src` - `[batch, q_len, d_model]`
    /// * `keys` / `values` - `[batch, heads, k_len, d_k]`
    /// * `causal` - mask out future key positions
    /// * `padding_mask` - optional `[batch, k_len]` mask, 1.0 = attend
    ///
    /// Returns `[batch, q_len, d_model]`.
    ///
    /// # Errors
    ///
    /// Returns error on shape mismatch.
    pub fn attend(
        &self,
        query_src: &Tensor<f32>,
        keys: &Tensor<f32>,
        values: &Tensor<f32>,
        causal: bool,
        padding_mask: Option<&Tensor<f32>>,
    ) -> Result<Tensor<f32>> {
        let q = ops::split_heads(&self.q_proj.forward(query_src)?, self.num_heads)?;
        let q = ops::scale(&q, self.scale)?;

        let k_t = ops::transpose(keys, &[0, 1, 3, 2])?;
        let mut scores = ops::matmul(&q, &k_t)?;
        if causal {
            scores = ops::causal_mask_add(&scores)?;
        }
        if let Some(mask) = padding_mask {
            scores = ops::padding_mask_add(&scores, mask)?;
        }

        let weights = softmax(&scores)?;
        let context = ops::matmul(&weights, values)?;
        let merged = ops::merge_heads(&context)?;
        self.out_proj.forward(&merged)
    }

    /// Self-attention convenience: project K/V from the query source
    ///
    /// Returns the attention output along with the key/value head tensors
    /// for cache capture.
    ///
    /// # Errors
    ///
    /// Returns error on shape mismatch.
    pub fn forward_self(
        &self,
        input: &Tensor<f32>,
        causal: bool,
        padding_mask: Option<&Tensor<f32>>,
    ) -> Result<(Tensor<f32>, Tensor<f32>, Tensor<f32>)> {
        let (k, v) = self.project_kv(input)?;
        let out = self.attend(input, &k, &v, causal, padding_mask)?;
        Ok((out, k, v))
    }

    /// Number of attention heads
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Per-head dimension
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Query scale factor
    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Query projection
    #[must_use]
    pub fn q_proj(&self) -> &Linear {
        &self.q_proj
    }

    /// Key projection
    #[must_use]
    pub fn k_proj(&self) -> &Linear {
        &self.k_proj
    }

    /// Value projection
    #[must_use]
    pub fn v_proj(&self) -> &Linear {
        &self.v_proj
    }

    /// Output projection
    #[must_use]
    pub fn out_proj(&self) -> &Linear {
        &self.out_proj
    }
}
