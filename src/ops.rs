//! Structural tensor kernels
//!
//! Shape-polymorphic primitives shared by three consumers: the eager layer
//! forwards, the tracer's value evaluation, and the graph executor. Keeping
//! one implementation per primitive means the eager reference path and the
//! exported-graph path run the same arithmetic in the same order.
//!
//! All kernels are data-independent: control flow depends only on shapes,
//! never on tensor values. That property is what makes the traced graphs
//! static.

use crate::error::{PortarError, Result};
use crate::tensor::{strides, Tensor};

/// Additive mask value for disallowed attention positions
///
/// Large negative finite value rather than `-inf` so a fully-masked row
/// still softmaxes to finite weights instead of NaN.
pub const MASK_NEG: f32 = -1e9;

/// Batched matrix multiplication
///
/// Two supported forms:
/// - `[..., m, k] @ [k, n]`: right operand is a rank-2 weight, broadcast
///   over all leading dimensions of the left operand
/// - `[d0.., m, k] @ [d0.., k, n]`: equal ranks >= 3 with identical
///   leading (batch) dimensions
///
/// # Errors
///
/// Returns error on rank or inner-dimension mismatch.
pub fn matmul(a: &Tensor<f32>, b: &Tensor<f32>) -> Result<Tensor<f32>> {
    let a_shape = a.shape();
    let b_shape = b.shape();

    if a_shape.len() < 2 || b_shape.len() < 2 {
        return Err(PortarError::InvalidShape {
            reason: format!(
                "matmul requires rank >= 2, got {} and {}",
                a_shape.len(),
                b_shape.len()
            ),
        });
    }

    let m = a_shape[a_shape.len() - 2];
    let k = a_shape[a_shape.len() - 1];

    let (k2, n, batch) = if b_shape.len() == 2 {
        let batch: usize = a_shape[..a_shape.len() - 2].iter().product();
        (b_shape[0], b_shape[1], batch)
    } else {
        if a_shape.len() != b_shape.len() {
            return Err(PortarError::InvalidShape {
                reason: format!(
                    "matmul rank mismatch: {} vs {}",
                    a_shape.len(),
                    b_shape.len()
                ),
            });
        }
        let a_lead = &a_shape[..a_shape.len() - 2];
        let b_lead = &b_shape[..b_shape.len() - 2];
        if a_lead != b_lead {
            return Err(PortarError::InvalidShape {
                reason: format!("matmul batch dims mismatch: {a_lead:?} vs {b_lead:?}"),
            });
        }
        let batch: usize = a_lead.iter().product();
        (
            b_shape[b_shape.len() - 2],
            b_shape[b_shape.len() - 1],
            batch,
        )
    };

    if k != k2 {
        return Err(PortarError::InvalidShape {
            reason: format!("matmul inner dims mismatch: {k} vs {k2}"),
        });
    }

    let a_data = a.data();
    let b_data = b.data();
    let b_per_batch = if b_shape.len() == 2 { 0 } else { k * n };

    let mut out = vec![0.0f32; batch * m * n];
    for bi in 0..batch {
        let a_base = bi * m * k;
        let b_base = bi * b_per_batch;
        let o_base = bi * m * n;
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0;
                for kk in 0..k {
                    sum += a_data[a_base + i * k + kk] * b_data[b_base + kk * n + j];
                }
                out[o_base + i * n + j] = sum;
            }
        }
    }

    let mut out_shape = a_shape[..a_shape.len() - 2].to_vec();
    out_shape.push(m);
    out_shape.push(n);
    Tensor::from_vec(out_shape, out)
}

/// Permute tensor axes
///
/// # Errors
///
/// Returns error if `perm` is not a permutation of `0..rank`.
pub fn transpose(x: &Tensor<f32>, perm: &[usize]) -> Result<Tensor<f32>> {
    let in_shape = x.shape();
    let rank = in_shape.len();

    if perm.len() != rank {
        return Err(PortarError::InvalidShape {
            reason: format!("Permutation length {} != rank {rank}", perm.len()),
        });
    }
    let mut seen = vec![false; rank];
    for &p in perm {
        if p >= rank || seen[p] {
            return Err(PortarError::InvalidShape {
                reason: format!("Invalid permutation {perm:?} for rank {rank}"),
            });
        }
        seen[p] = true;
    }

    let out_shape: Vec<usize> = perm.iter().map(|&p| in_shape[p]).collect();
    let in_strides = strides(in_shape);
    let out_strides = strides(&out_shape);

    let data = x.data();
    let mut out = vec![0.0f32; data.len()];
    for (out_idx, slot) in out.iter_mut().enumerate() {
        let mut rem = out_idx;
        let mut in_idx = 0;
        for d in 0..rank {
            let coord = rem / out_strides[d];
            rem %= out_strides[d];
            in_idx += coord * in_strides[perm[d]];
        }
        *slot = data[in_idx];
    }

    Tensor::from_vec(out_shape, out)
}

/// Embedding lookup: `table[ids]`
///
/// `table` is `[vocab, dim]`, `ids` is any shape; output appends `dim`.
///
/// # Errors
///
/// Returns error if any id is out of vocabulary range.
pub fn gather(table: &Tensor<f32>, ids: &Tensor<u32>) -> Result<Tensor<f32>> {
    let t_shape = table.shape();
    if t_shape.len() != 2 {
        return Err(PortarError::InvalidShape {
            reason: format!("Gather table must be rank 2, got {}", t_shape.len()),
        });
    }
    let (vocab, dim) = (t_shape[0], t_shape[1]);

    let t_data = table.data();
    let mut out = Vec::with_capacity(ids.size() * dim);
    for &id in ids.data() {
        let id = id as usize;
        if id >= vocab {
            return Err(PortarError::InvalidShape {
                reason: format!("Token id {id} out of range (vocab {vocab})"),
            });
        }
        out.extend_from_slice(&t_data[id * dim..(id + 1) * dim]);
    }

    let mut out_shape = ids.shape().to_vec();
    out_shape.push(dim);
    Tensor::from_vec(out_shape, out)
}

/// Elementwise addition with last-dimension bias broadcast
///
/// Accepts either two tensors of identical shape, or a rank-1 right operand
/// matching the left operand's last dimension (bias broadcast).
///
/// # Errors
///
/// Returns error on any other shape combination.
pub fn add(a: &Tensor<f32>, b: &Tensor<f32>) -> Result<Tensor<f32>> {
    if a.shape() == b.shape() {
        let out = a
            .data()
            .iter()
            .zip(b.data().iter())
            .map(|(&x, &y)| x + y)
            .collect();
        return Tensor::from_vec(a.shape().to_vec(), out);
    }

    let last = a.shape()[a.ndim() - 1];
    if b.ndim() == 1 && b.shape()[0] == last {
        let b_data = b.data();
        let out = a
            .data()
            .iter()
            .enumerate()
            .map(|(i, &x)| x + b_data[i % last])
            .collect();
        return Tensor::from_vec(a.shape().to_vec(), out);
    }

    Err(PortarError::InvalidShape {
        reason: format!(
            "Add shapes incompatible: {:?} vs {:?}",
            a.shape(),
            b.shape()
        ),
    })
}

/// Multiply every element by a constant factor
///
/// # Errors
///
/// Never fails for a valid tensor; returns `Result` for interface symmetry
/// with the other kernels.
pub fn scale(x: &Tensor<f32>, factor: f32) -> Result<Tensor<f32>> {
    let out = x.data().iter().map(|&v| v * factor).collect();
    Tensor::from_vec(x.shape().to_vec(), out)
}

/// Reshape `[batch, seq, d_model]` into per-head layout `[batch, heads, seq, d_k]`
///
/// # Errors
///
/// Returns error if rank != 3 or `d_model` is not divisible by `heads`.
pub fn split_heads(x: &Tensor<f32>, heads: usize) -> Result<Tensor<f32>> {
    let shape = x.shape();
    if shape.len() != 3 {
        return Err(PortarError::InvalidShape {
            reason: format!("split_heads expects rank 3, got {}", shape.len()),
        });
    }
    let (batch, seq, d_model) = (shape[0], shape[1], shape[2]);
    if heads == 0 || d_model % heads != 0 {
        return Err(PortarError::InvalidShape {
            reason: format!("d_model {d_model} not divisible by heads {heads}"),
        });
    }
    let d_k = d_model / heads;

    let data = x.data();
    let mut out = vec![0.0f32; data.len()];
    for b in 0..batch {
        for h in 0..heads {
            for s in 0..seq {
                for k in 0..d_k {
                    out[((b * heads + h) * seq + s) * d_k + k] =
                        data[(b * seq + s) * d_model + h * d_k + k];
                }
            }
        }
    }
    Tensor::from_vec(vec![batch, heads, seq, d_k], out)
}

/// Inverse of [`split_heads`]: `[batch, heads, seq, d_k]` → `[batch, seq, heads*d_k]`
///
/// # Errors
///
/// Returns error if rank != 4.
pub fn merge_heads(x: &Tensor<f32>) -> Result<Tensor<f32>> {
    let shape = x.shape();
    if shape.len() != 4 {
        return Err(PortarError::InvalidShape {
            reason: format!("merge_heads expects rank 4, got {}", shape.len()),
        });
    }
    let (batch, heads, seq, d_k) = (shape[0], shape[1], shape[2], shape[3]);

    let data = x.data();
    let mut out = vec![0.0f32; data.len()];
    for b in 0..batch {
        for s in 0..seq {
            for h in 0..heads {
                for k in 0..d_k {
                    out[(b * seq + s) * heads * d_k + h * d_k + k] =
                        data[((b * heads + h) * seq + s) * d_k + k];
                }
            }
        }
    }
    Tensor::from_vec(vec![batch, seq, heads * d_k], out)
}

/// Concatenate two tensors along one axis
///
/// # Errors
///
/// Returns error if ranks differ or any non-`axis` dimension differs.
pub fn concat(a: &Tensor<f32>, b: &Tensor<f32>, axis: usize) -> Result<Tensor<f32>> {
    let a_shape = a.shape();
    let b_shape = b.shape();

    if a_shape.len() != b_shape.len() || axis >= a_shape.len() {
        return Err(PortarError::InvalidShape {
            reason: format!("Concat rank/axis mismatch: {a_shape:?} vs {b_shape:?} axis {axis}"),
        });
    }
    for (d, (&x, &y)) in a_shape.iter().zip(b_shape.iter()).enumerate() {
        if d != axis && x != y {
            return Err(PortarError::InvalidShape {
                reason: format!("Concat dim {d} mismatch: {x} vs {y}"),
            });
        }
    }

    let outer: usize = a_shape[..axis].iter().product();
    let a_rest: usize = a_shape[axis..].iter().product();
    let b_rest: usize = b_shape[axis..].iter().product();

    let a_data = a.data();
    let b_data = b.data();
    let mut out = Vec::with_capacity(a_data.len() + b_data.len());
    for o in 0..outer {
        out.extend_from_slice(&a_data[o * a_rest..(o + 1) * a_rest]);
        out.extend_from_slice(&b_data[o * b_rest..(o + 1) * b_rest]);
    }

    let mut out_shape = a_shape.to_vec();
    out_shape[axis] = a_shape[axis] + b_shape[axis];
    Tensor::from_vec(out_shape, out)
}

/// Additive causal mask over attention scores `[batch, heads, q_len, k_len]`
///
/// Query position `i` may attend to key position `j` only when
/// `j <= i + (k_len - q_len)`; the offset handles queries continuing an
/// existing key history.
///
/// # Errors
///
/// Returns error if rank != 4 or `k_len < q_len`.
pub fn causal_mask_add(scores: &Tensor<f32>) -> Result<Tensor<f32>> {
    let shape = scores.shape();
    if shape.len() != 4 {
        return Err(PortarError::InvalidShape {
            reason: format!("Causal mask expects rank 4 scores, got {}", shape.len()),
        });
    }
    let (q_len, k_len) = (shape[2], shape[3]);
    if k_len < q_len {
        return Err(PortarError::InvalidShape {
            reason: format!("Causal mask requires k_len >= q_len, got {k_len} < {q_len}"),
        });
    }
    let offset = k_len - q_len;

    let groups = shape[0] * shape[1];
    let data = scores.data();
    let mut out = vec![0.0f32; data.len()];
    for g in 0..groups {
        for i in 0..q_len {
            for j in 0..k_len {
                let idx = (g * q_len + i) * k_len + j;
                out[idx] = if j <= i + offset {
                    data[idx]
                } else {
                    data[idx] + MASK_NEG
                };
            }
        }
    }
    Tensor::from_vec(shape.to_vec(), out)
}

/// Additive padding mask over attention scores
///
/// `scores` is `[batch, heads, q_len, k_len]`, `mask` is `[batch, k_len]`
/// with 1.0 = attend, 0.0 = masked out.
///
/// # Errors
///
/// Returns error on rank or dimension mismatch.
pub fn padding_mask_add(scores: &Tensor<f32>, mask: &Tensor<f32>) -> Result<Tensor<f32>> {
    let s_shape = scores.shape();
    let m_shape = mask.shape();
    if s_shape.len() != 4 || m_shape.len() != 2 {
        return Err(PortarError::InvalidShape {
            reason: format!(
                "Padding mask expects rank-4 scores and rank-2 mask, got {} and {}",
                s_shape.len(),
                m_shape.len()
            ),
        });
    }
    let (batch, heads, q_len, k_len) = (s_shape[0], s_shape[1], s_shape[2], s_shape[3]);
    if m_shape[0] != batch || m_shape[1] != k_len {
        return Err(PortarError::InvalidShape {
            reason: format!("Padding mask shape {m_shape:?} != [{batch}, {k_len}]"),
        });
    }

    let s_data = scores.data();
    let m_data = mask.data();
    let mut out = vec![0.0f32; s_data.len()];
    for b in 0..batch {
        for h in 0..heads {
            for i in 0..q_len {
                for j in 0..k_len {
                    let idx = ((b * heads + h) * q_len + i) * k_len + j;
                    out[idx] = s_data[idx] + (1.0 - m_data[b * k_len + j]) * MASK_NEG;
                }
            }
        }
    }
    Tensor::from_vec(s_shape.to_vec(), out)
}

/// Add position-table rows to a `[batch, seq, dim]` tensor
///
/// Row `offset + s` of `table` is added to sequence position `s` of every
/// batch element. `offset` is the number of already-consumed positions (0
/// for a fresh sequence, the cache length for an incremental step).
///
/// # Errors
///
/// Returns error if the table is too short for `offset + seq` or the
/// feature dimensions differ.
pub fn add_position(x: &Tensor<f32>, table: &Tensor<f32>, offset: usize) -> Result<Tensor<f32>> {
    let x_shape = x.shape();
    let t_shape = table.shape();
    if x_shape.len() != 3 || t_shape.len() != 2 {
        return Err(PortarError::InvalidShape {
            reason: format!(
                "add_position expects rank-3 input and rank-2 table, got {} and {}",
                x_shape.len(),
                t_shape.len()
            ),
        });
    }
    let (batch, seq, dim) = (x_shape[0], x_shape[1], x_shape[2]);
    if t_shape[1] != dim {
        return Err(PortarError::InvalidShape {
            reason: format!("Position table dim {} != input dim {dim}", t_shape[1]),
        });
    }
    if offset + seq > t_shape[0] {
        return Err(PortarError::InvalidShape {
            reason: format!(
                "Sequence end {} exceeds position table length {}",
                offset + seq,
                t_shape[0]
            ),
        });
    }

    let x_data = x.data();
    let t_data = table.data();
    let mut out = vec![0.0f32; x_data.len()];
    for b in 0..batch {
        for s in 0..seq {
            for d in 0..dim {
                out[(b * seq + s) * dim + d] =
                    x_data[(b * seq + s) * dim + d] + t_data[(offset + s) * dim + d];
            }
        }
    }
    Tensor::from_vec(x_shape.to_vec(), out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(shape: &[usize], data: &[f32]) -> Tensor<f32> {
        Tensor::from_vec(shape.to_vec(), data.to_vec()).unwrap()
    }

    #[test]
    fn test_matmul_weight_broadcast() {
        // [1, 2, 2] @ [2, 2]
        let a = t(&[1, 2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let w = t(&[2, 2], &[1.0, 0.0, 0.0, 1.0]);
        let y = matmul(&a, &w).unwrap();
        assert_eq!(y.shape(), &[1, 2, 2]);
        assert_eq!(y.data(), a.data());
    }

    #[test]
    fn test_matmul_batched() {
        let a = t(&[2, 1, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = t(&[2, 2, 1], &[1.0, 1.0, 1.0, 1.0]);
        let y = matmul(&a, &b).unwrap();
        assert_eq!(y.shape(), &[2, 1, 1]);
        assert_eq!(y.data(), &[3.0, 7.0]);
    }

    #[test]
    fn test_matmul_inner_mismatch() {
        let a = t(&[2, 3], &[0.0; 6]);
        let b = t(&[2, 2], &[0.0; 4]);
        assert!(matmul(&a, &b).is_err());
    }

    #[test]
    fn test_transpose_2d() {
        let x = t(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let y = transpose(&x, &[1, 0]).unwrap();
        assert_eq!(y.shape(), &[3, 2]);
        assert_eq!(y.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_last_two_of_rank4() {
        let x = t(&[1, 1, 2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let y = transpose(&x, &[0, 1, 3, 2]).unwrap();
        assert_eq!(y.shape(), &[1, 1, 3, 2]);
        assert_eq!(y.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_bad_perm() {
        let x = t(&[2, 2], &[0.0; 4]);
        assert!(transpose(&x, &[0, 0]).is_err());
        assert!(transpose(&x, &[0]).is_err());
    }

    #[test]
    fn test_gather() {
        let table = t(&[3, 2], &[0.0, 0.1, 1.0, 1.1, 2.0, 2.1]);
        let ids = Tensor::from_vec(vec![1, 2], vec![2u32, 0]).unwrap();
        let y = gather(&table, &ids).unwrap();
        assert_eq!(y.shape(), &[1, 2, 2]);
        assert_eq!(y.data(), &[2.0, 2.1, 0.0, 0.1]);
    }

    #[test]
    fn test_gather_out_of_range() {
        let table = t(&[3, 2], &[0.0; 6]);
        let ids = Tensor::from_vec(vec![1], vec![3u32]).unwrap();
        assert!(gather(&table, &ids).is_err());
    }

    #[test]
    fn test_add_same_shape_and_bias() {
        let a = t(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = t(&[2, 2], &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(add(&a, &b).unwrap().data(), &[2.0, 3.0, 4.0, 5.0]);

        let bias = t(&[2], &[10.0, 20.0]);
        assert_eq!(add(&a, &bias).unwrap().data(), &[11.0, 22.0, 13.0, 24.0]);

        let bad = t(&[3], &[0.0; 3]);
        assert!(add(&a, &bad).is_err());
    }

    #[test]
    fn test_split_merge_heads_roundtrip() {
        let x = t(&[1, 2, 4], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let split = split_heads(&x, 2).unwrap();
        assert_eq!(split.shape(), &[1, 2, 2, 2]);
        // head 0 holds features 0..2, head 1 holds features 2..4
        assert_eq!(split.data(), &[0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0]);
        let merged = merge_heads(&split).unwrap();
        assert_eq!(merged, x);
    }

    #[test]
    fn test_concat_axis2() {
        let a = t(&[1, 1, 2, 1], &[1.0, 2.0]);
        let b = t(&[1, 1, 1, 1], &[3.0]);
        let y = concat(&a, &b, 2).unwrap();
        assert_eq!(y.shape(), &[1, 1, 3, 1]);
        assert_eq!(y.data(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_concat_dim_mismatch() {
        let a = t(&[1, 2], &[0.0; 2]);
        let b = t(&[2, 2], &[0.0; 4]);
        assert!(concat(&a, &b, 1).is_err());
    }

    #[test]
    fn test_causal_mask_square() {
        let scores = t(&[1, 1, 2, 2], &[0.0; 4]);
        let y = causal_mask_add(&scores).unwrap();
        assert_eq!(y.data()[0], 0.0); // (0,0) allowed
        assert_eq!(y.data()[1], MASK_NEG); // (0,1) masked
        assert_eq!(y.data()[2], 0.0);
        assert_eq!(y.data()[3], 0.0);
    }

    #[test]
    fn test_causal_mask_with_history_offset() {
        // one query over three keys: everything visible
        let scores = t(&[1, 1, 1, 3], &[0.0; 3]);
        let y = causal_mask_add(&scores).unwrap();
        assert!(y.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_padding_mask() {
        let scores = t(&[1, 1, 1, 2], &[0.0, 0.0]);
        let mask = t(&[1, 2], &[1.0, 0.0]);
        let y = padding_mask_add(&scores, &mask).unwrap();
        assert_eq!(y.data()[0], 0.0);
        assert_eq!(y.data()[1], MASK_NEG);
    }

    #[test]
    fn test_add_position_offset() {
        let x = t(&[1, 1, 2], &[0.0, 0.0]);
        let table = t(&[3, 2], &[0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        let y = add_position(&x, &table, 2).unwrap();
        assert_eq!(y.data(), &[2.0, 2.0]);
        assert!(add_position(&x, &table, 3).is_err());
    }
}
