//! Sinusoidal position embeddings
//!
//! The seq2seq architecture uses a fixed (non-learned) sinusoidal position
//! table added to scaled token embeddings. The table is precomputed once
//! per model and exported as a graph constant; decoding steps index into
//! it at an offset equal to the cache length.

use crate::error::{PortarError, Result};
use crate::tensor::Tensor;

/// Precompute a sinusoidal position table `[max_positions, dim]`
///
/// Interleaved layout: even feature indices carry `sin(pos / 10000^(i/dim))`,
/// odd indices the matching `cos`.
///
/// # Errors
///
/// Returns error if `dim` is odd or either argument is zero.
pub fn sinusoidal_table(max_positions: usize, dim: usize) -> Result<Tensor<f32>> {
    if max_positions == 0 || dim == 0 {
        return Err(PortarError::InvalidShape {
            reason: "Position table dimensions must be > 0".to_string(),
        });
    }
    if dim % 2 != 0 {
        return Err(PortarError::InvalidShape {
            reason: format!("Position table dim must be even, got {dim}"),
        });
    }

    let mut data = vec![0.0f32; max_positions * dim];
    for pos in 0..max_positions {
        for i in 0..dim / 2 {
            #[allow(clippy::cast_precision_loss)]
            let freq = 1.0 / 10000.0f64.powf(2.0 * i as f64 / dim as f64);
            #[allow(clippy::cast_precision_loss)]
            let angle = pos as f64 * freq;
            #[allow(clippy::cast_possible_truncation)]
            {
                data[pos * dim + 2 * i] = angle.sin() as f32;
                data[pos * dim + 2 * i + 1] = angle.cos() as f32;
            }
        }
    }

    Tensor::from_vec(vec![max_positions, dim], data)
}
