//! Neural network layers for the seq2seq transformer
//!
//! Implements the eager building blocks the conversion pipeline extracts
//! and traces:
//! - Layer normalization
//! - Linear projection
//! - Token embedding
//! - Feed-forward network
//! - Multi-head attention (self, causal, cross; see [`attention`])
//! - Sinusoidal position table (see [`position`])
//!
//! The eager forwards here are the reference semantics the export verifier
//! compares traced graphs against. They are composed from the same kernels
//! in [`crate::ops`] that the graph executor dispatches to.

use serde::{Deserialize, Serialize};

use crate::error::{PortarError, Result};
use crate::ops;
use crate::tensor::Tensor;

mod attention;
mod position;

pub use attention::MultiHeadAttention;
pub use position::sinusoidal_table;

/// Apply softmax along the last dimension
///
/// Numerically stable implementation with max subtraction.
///
/// # Errors
///
/// Returns error if input is empty.
pub fn softmax(input: &Tensor<f32>) -> Result<Tensor<f32>> {
    let data = input.data();
    let shape = input.shape();

    if data.is_empty() || shape.is_empty() {
        return Err(PortarError::InvalidShape {
            reason: "Cannot apply softmax to empty tensor".to_string(),
        });
    }

    let last_dim = shape[shape.len() - 1];
    let num_groups = data.len() / last_dim;
    let mut output = Vec::with_capacity(data.len());

    for group_idx in 0..num_groups {
        let group = &data[group_idx * last_dim..(group_idx + 1) * last_dim];

        let max_val = group.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp_vals: Vec<f32> = group.iter().map(|&x| (x - max_val).exp()).collect();
        let sum_exp: f32 = exp_vals.iter().sum();

        for &exp_val in &exp_vals {
            output.push(exp_val / sum_exp);
        }
    }

    Tensor::from_vec(shape.to_vec(), output)
}

/// Apply ReLU activation element-wise
///
/// # Errors
///
/// Returns error if input is empty.
pub fn relu(input: &Tensor<f32>) -> Result<Tensor<f32>> {
    if input.data().is_empty() {
        return Err(PortarError::InvalidShape {
            reason: "Cannot apply ReLU to empty tensor".to_string(),
        });
    }
    let output = input.data().iter().map(|&x| x.max(0.0)).collect();
    Tensor::from_vec(input.shape().to_vec(), output)
}

/// Apply GELU activation element-wise
///
/// Tanh approximation: `y = 0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 * x³)))`
///
/// # Errors
///
/// Returns error if input is empty.
pub fn gelu(input: &Tensor<f32>) -> Result<Tensor<f32>> {
    if input.data().is_empty() {
        return Err(PortarError::InvalidShape {
            reason: "Cannot apply GELU to empty tensor".to_string(),
        });
    }
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    let output = input
        .data()
        .iter()
        .map(|&x| 0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh()))
        .collect();
    Tensor::from_vec(input.shape().to_vec(), output)
}

/// Layer normalization over the last dimension
///
/// ```text
/// y = (x - mean(x)) / sqrt(variance(x) + eps) * weight + bias
/// ```
///
/// # Errors
///
/// Returns error if the last dimension doesn't match the parameter length.
pub fn layer_norm(
    input: &Tensor<f32>,
    weight: &[f32],
    bias: &[f32],
    eps: f32,
) -> Result<Tensor<f32>> {
    let shape = input.shape();
    if shape.is_empty() {
        return Err(PortarError::InvalidShape {
            reason: "Input tensor cannot be empty".to_string(),
        });
    }

    let dim = shape[shape.len() - 1];
    if dim != weight.len() || dim != bias.len() {
        return Err(PortarError::InvalidShape {
            reason: format!(
                "Last dimension {dim} doesn't match parameter length {}/{}",
                weight.len(),
                bias.len()
            ),
        });
    }

    let data = input.data();
    let num_groups = data.len() / dim;
    let mut output = Vec::with_capacity(data.len());

    for group_idx in 0..num_groups {
        let group = &data[group_idx * dim..(group_idx + 1) * dim];

        #[allow(clippy::cast_precision_loss)]
        let mean: f32 = group.iter().sum::<f32>() / dim as f32;
        #[allow(clippy::cast_precision_loss)]
        let variance: f32 = group
            .iter()
            .map(|&x| {
                let diff = x - mean;
                diff * diff
            })
            .sum::<f32>()
            / dim as f32;

        let inv_std = 1.0 / (variance + eps).sqrt();
        for (i, &x) in group.iter().enumerate() {
            output.push((x - mean) * inv_std * weight[i] + bias[i]);
        }
    }

    debug_assert!(
        output.iter().all(|&x| x.is_finite()),
        "LayerNorm produced NaN or Inf values - check input distribution"
    );

    Tensor::from_vec(shape.to_vec(), output)
}

/// Feed-forward activation function selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// Rectified linear unit
    Relu,
    /// Gaussian error linear unit (tanh approximation)
    Gelu,
}

impl Activation {
    /// Apply the activation to a tensor
    ///
    /// # Errors
    ///
    /// Returns error if input is empty.
    pub fn apply(self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        match self {
            Self::Relu => relu(input),
            Self::Gelu => gelu(input),
        }
    }
}

/// Linear transformation layer
///
/// Applies `y = x @ W.T + b`. The weight is stored `[out_features,
/// in_features]`, the layout pretrained checkpoints ship projections in;
/// the forward pass transposes it, which is what lets the graph optimizer
/// later fold the transposed constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    /// Input feature count
    in_features: usize,
    /// Output feature count
    out_features: usize,
    /// Weight matrix `[out_features, in_features]`
    weight: Tensor<f32>,
    /// Bias vector `[out_features]`
    bias: Tensor<f32>,
}

impl Linear {
    /// Create a linear layer from a weight matrix and bias vector
    ///
    /// # Errors
    ///
    /// Returns error if the weight is not `[out, in]` rank 2 or the bias
    /// length doesn't match.
    pub fn new(weight: Tensor<f32>, bias: Tensor<f32>) -> Result<Self> {
        if weight.ndim() != 2 {
            return Err(PortarError::InvalidShape {
                reason: format!("Linear weight must be rank 2, got {}", weight.ndim()),
            });
        }
        let out_features = weight.shape()[0];
        let in_features = weight.shape()[1];
        if bias.ndim() != 1 || bias.shape()[0] != out_features {
            return Err(PortarError::InvalidShape {
                reason: format!(
                    "Linear bias shape {:?} != [{out_features}]",
                    bias.shape()
                ),
            });
        }
        Ok(Self {
            in_features,
            out_features,
            weight,
            bias,
        })
    }

    /// Forward pass: `x @ W.T + b`
    ///
    /// # Errors
    ///
    /// Returns error if the input's last dimension != `in_features`.
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let last = input.shape()[input.ndim() - 1];
        if last != self.in_features {
            return Err(PortarError::InvalidShape {
                reason: format!(
                    "Linear input dim {last} != in_features {}",
                    self.in_features
                ),
            });
        }
        let w_t = ops::transpose(&self.weight, &[1, 0])?;
        let projected = ops::matmul(input, &w_t)?;
        ops::add(&projected, &self.bias)
    }

    /// Input feature count
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output feature count
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// The stored weight matrix `[out, in]`
    #[must_use]
    pub fn weight(&self) -> &Tensor<f32> {
        &self.weight
    }

    /// The stored bias vector `[out]`
    #[must_use]
    pub fn bias(&self) -> &Tensor<f32> {
        &self.bias
    }
}

/// Layer normalization with learned affine parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNorm {
    /// Feature dimension
    dim: usize,
    /// Epsilon for numerical stability
    eps: f32,
    /// Scale parameter (gamma)
    weight: Tensor<f32>,
    /// Shift parameter (beta)
    bias: Tensor<f32>,
}

impl LayerNorm {
    /// Create a layer norm from learned parameters
    ///
    /// # Errors
    ///
    /// Returns error if weight and bias are not rank-1 of equal length.
    pub fn new(weight: Tensor<f32>, bias: Tensor<f32>, eps: f32) -> Result<Self> {
        if weight.ndim() != 1 || bias.shape() != weight.shape() {
            return Err(PortarError::InvalidShape {
                reason: format!(
                    "LayerNorm parameters must be equal rank-1 vectors, got {:?} and {:?}",
                    weight.shape(),
                    bias.shape()
                ),
            });
        }
        let dim = weight.shape()[0];
        Ok(Self {
            dim,
            eps,
            weight,
            bias,
        })
    }

    /// Forward pass over the last dimension
    ///
    /// # Errors
    ///
    /// Returns error if the last dimension doesn't match.
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        layer_norm(input, self.weight.data(), self.bias.data(), self.eps)
    }

    /// Feature dimension
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Epsilon value
    #[must_use]
    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// Scale parameter
    #[must_use]
    pub fn weight(&self) -> &Tensor<f32> {
        &self.weight
    }

    /// Shift parameter
    #[must_use]
    pub fn bias(&self) -> &Tensor<f32> {
        &self.bias
    }
}

/// Token embedding table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// Embedding table `[vocab_size, dim]`
    weight: Tensor<f32>,
}

impl Embedding {
    /// Create an embedding from a `[vocab, dim]` table
    ///
    /// # Errors
    ///
    /// Returns error if the table is not rank 2.
    pub fn new(weight: Tensor<f32>) -> Result<Self> {
        if weight.ndim() != 2 {
            return Err(PortarError::InvalidShape {
                reason: format!("Embedding table must be rank 2, got {}", weight.ndim()),
            });
        }
        Ok(Self { weight })
    }

    /// Look up embeddings for token ids
    ///
    /// # Errors
    ///
    /// Returns error if any id is out of vocabulary range.
    pub fn forward(&self, ids: &Tensor<u32>) -> Result<Tensor<f32>> {
        ops::gather(&self.weight, ids)
    }

    /// Vocabulary size
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.weight.shape()[0]
    }

    /// The embedding table
    #[must_use]
    pub fn weight(&self) -> &Tensor<f32> {
        &self.weight
    }
}

/// Position-wise feed-forward network: `down(act(up(x)))`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForward {
    /// Up projection `[d_model] -> [ffn_dim]`
    up: Linear,
    /// Down projection `[ffn_dim] -> [d_model]`
    down: Linear,
    /// Activation between the projections
    activation: Activation,
}

impl FeedForward {
    /// Assemble a feed-forward block
    ///
    /// # Errors
    ///
    /// Returns error if the projections don't compose.
    pub fn new(up: Linear, down: Linear, activation: Activation) -> Result<Self> {
        if up.out_features() != down.in_features() {
            return Err(PortarError::InvalidShape {
                reason: format!(
                    "FFN projections don't compose: up out {} != down in {}",
                    up.out_features(),
                    down.in_features()
                ),
            });
        }
        Ok(Self {
            up,
            down,
            activation,
        })
    }

    /// Forward pass
    ///
    /// # Errors
    ///
    /// Returns error on shape mismatch.
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let hidden = self.up.forward(input)?;
        let activated = self.activation.apply(&hidden)?;
        self.down.forward(&activated)
    }

    /// Up projection
    #[must_use]
    pub fn up(&self) -> &Linear {
        &self.up
    }

    /// Down projection
    #[must_use]
    pub fn down(&self) -> &Linear {
        &self.down
    }

    /// Activation function
    #[must_use]
    pub fn activation(&self) -> Activation {
        self.activation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let input = Tensor::from_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]).unwrap();
        let output = softmax(&input).unwrap();
        for row in output.data().chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        // uniform row
        assert!((output.data()[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_relu_clamps_negatives() {
        let input = Tensor::from_vec(vec![3], vec![-1.0, 0.0, 2.0]).unwrap();
        assert_eq!(relu(&input).unwrap().data(), &[0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_gelu_known_values() {
        let input = Tensor::from_vec(vec![2], vec![0.0, 1.0]).unwrap();
        let output = gelu(&input).unwrap();
        assert_eq!(output.data()[0], 0.0);
        assert!((output.data()[1] - 0.8412).abs() < 1e-3);
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let input = Tensor::from_vec(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let output = layer_norm(&input, &[1.0; 4], &[0.0; 4], 1e-5).unwrap();
        let mean: f32 = output.data().iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        let var: f32 = output.data().iter().map(|&x| x * x).sum::<f32>() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_linear_identity() {
        // W = I stored [out, in], bias = 0
        let w = Tensor::from_vec(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let b = Tensor::zeros(vec![2]).unwrap();
        let linear = Linear::new(w, b).unwrap();
        let x = Tensor::from_vec(vec![1, 1, 2], vec![3.0, 4.0]).unwrap();
        let y = linear.forward(&x).unwrap();
        assert_eq!(y.data(), &[3.0, 4.0]);
    }

    #[test]
    fn test_linear_applies_bias_and_transpose() {
        // W [out=1, in=2] = [[2, 3]], b = [10] => y = 2*x0 + 3*x1 + 10
        let w = Tensor::from_vec(vec![1, 2], vec![2.0, 3.0]).unwrap();
        let b = Tensor::from_vec(vec![1], vec![10.0]).unwrap();
        let linear = Linear::new(w, b).unwrap();
        let x = Tensor::from_vec(vec![1, 1, 2], vec![1.0, 1.0]).unwrap();
        assert_eq!(linear.forward(&x).unwrap().data(), &[15.0]);
    }

    #[test]
    fn test_linear_rejects_bad_input_dim() {
        let w = Tensor::from_vec(vec![2, 3], vec![0.0; 6]).unwrap();
        let b = Tensor::zeros(vec![2]).unwrap();
        let linear = Linear::new(w, b).unwrap();
        let x = Tensor::from_vec(vec![1, 2], vec![0.0; 2]).unwrap();
        assert!(linear.forward(&x).is_err());
    }

    #[test]
    fn test_embedding_lookup() {
        let table = Tensor::from_vec(vec![3, 2], vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]).unwrap();
        let embed = Embedding::new(table).unwrap();
        let ids = Tensor::from_vec(vec![1, 2], vec![2u32, 1]).unwrap();
        let out = embed.forward(&ids).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2]);
        assert_eq!(out.data(), &[2.0, 2.0, 1.0, 1.0]);
        assert_eq!(embed.vocab_size(), 3);
    }

    #[test]
    fn test_feed_forward_relu_path() {
        // up: [2, 1] weight [[1],[-1]] expands 1 feature to 2
        let up = Linear::new(
            Tensor::from_vec(vec![2, 1], vec![1.0, -1.0]).unwrap(),
            Tensor::zeros(vec![2]).unwrap(),
        )
        .unwrap();
        let down = Linear::new(
            Tensor::from_vec(vec![1, 2], vec![1.0, 1.0]).unwrap(),
            Tensor::zeros(vec![1]).unwrap(),
        )
        .unwrap();
        let ffn = FeedForward::new(up, down, Activation::Relu).unwrap();
        let x = Tensor::from_vec(vec![1, 1, 1], vec![2.0]).unwrap();
        // up -> [2, -2], relu -> [2, 0], down -> 2
        assert_eq!(ffn.forward(&x).unwrap().data(), &[2.0]);
    }

    #[test]
    fn test_feed_forward_rejects_non_composing() {
        let up = Linear::new(
            Tensor::from_vec(vec![2, 1], vec![0.0; 2]).unwrap(),
            Tensor::zeros(vec![2]).unwrap(),
        )
        .unwrap();
        let down = Linear::new(
            Tensor::from_vec(vec![1, 3], vec![0.0; 3]).unwrap(),
            Tensor::zeros(vec![1]).unwrap(),
        )
        .unwrap();
        assert!(FeedForward::new(up, down, Activation::Gelu).is_err());
    }
}
