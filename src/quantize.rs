//! Weight quantization
//!
//! Converts optimized graphs to an integer-quantized representation:
//! eligible Gemm weight initializers become symmetric 8-bit blocks and
//! the consuming nodes become QGemm. Quantization runs per artifact and
//! independently across the four roles: one role failing never blocks
//! the others.
//!
//! ## Q8 block format
//!
//! Weights are quantized in blocks of 32 values:
//! - 1 float32 scale factor per block: `scale = max(|v|) / 127`
//! - 32 int8 quantized values: `q = round(v / scale)`
//! - Dequantization: `v = q * scale`
//!
//! Symmetric range only, no zero-point. The last block of a tensor is
//! zero-padded; the logical shape recovers the true length.

use tracing::{debug, info};

use crate::error::{PortarError, Result};
use crate::graph::{Op, PortGraph, Role, TensorPayload};
use crate::optimize::{FuseMatMulAdd, OptimizationPass, PruneDeadNodes};
use crate::tensor::Tensor;

/// Values per quantization block
pub const BLOCK_SIZE: usize = 32;

/// One quantized block: scale plus 32 int8 values
#[derive(Debug, Clone, PartialEq)]
pub struct Q8Block {
    /// Scale factor for dequantization
    pub scale: f32,
    /// Quantized values
    pub quants: [i8; BLOCK_SIZE],
}

impl Q8Block {
    /// Quantize up to 32 values (shorter slices are zero-padded)
    ///
    /// Symmetric quantization: `scale = max(|v|) / 127`, with a floor for
    /// near-zero blocks to avoid division by zero.
    #[must_use]
    pub fn quantize(values: &[f32]) -> Self {
        let max_abs = values.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
        let scale = if max_abs > 1e-10 {
            max_abs / 127.0
        } else {
            1.0 / 127.0
        };

        let mut quants = [0i8; BLOCK_SIZE];
        for (i, &v) in values.iter().take(BLOCK_SIZE).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            {
                quants[i] = (v / scale).round().clamp(-128.0, 127.0) as i8;
            }
        }
        Self { scale, quants }
    }

    /// Dequantize back to f32
    #[must_use]
    pub fn dequantize(&self) -> [f32; BLOCK_SIZE] {
        let mut values = [0.0f32; BLOCK_SIZE];
        for (i, &q) in self.quants.iter().enumerate() {
            values[i] = f32::from(q) * self.scale;
        }
        values
    }

    /// Maximum absolute round-trip error against the original values
    #[must_use]
    pub fn quantization_error(&self, original: &[f32]) -> f32 {
        let dequantized = self.dequantize();
        original
            .iter()
            .zip(dequantized.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max)
    }
}

/// Quantize a tensor into block scales and int8 values
#[must_use]
pub fn quantize_tensor(tensor: &Tensor<f32>) -> (Vec<f32>, Vec<i8>) {
    let data = tensor.data();
    let num_blocks = data.len().div_ceil(BLOCK_SIZE);
    let mut scales = Vec::with_capacity(num_blocks);
    let mut quants = Vec::with_capacity(num_blocks * BLOCK_SIZE);

    for chunk in data.chunks(BLOCK_SIZE) {
        let block = Q8Block::quantize(chunk);
        scales.push(block.scale);
        quants.extend_from_slice(&block.quants);
    }
    (scales, quants)
}

/// Rebuild an f32 tensor from Q8 blocks
///
/// # Errors
///
/// Returns error if the block data doesn't cover the logical shape.
pub fn dequantize_q8(scales: &[f32], quants: &[i8], shape: &[usize]) -> Result<Tensor<f32>> {
    let size: usize = shape.iter().product();
    if quants.len() < size || scales.len() * BLOCK_SIZE < size {
        return Err(PortarError::Format {
            reason: format!(
                "Q8 payload too short: {} quants / {} scales for {size} elements",
                quants.len(),
                scales.len()
            ),
        });
    }

    let mut data = Vec::with_capacity(size);
    for (i, &q) in quants.iter().take(size).enumerate() {
        data.push(f32::from(q) * scales[i / BLOCK_SIZE]);
    }
    Tensor::from_vec(shape.to_vec(), data)
}

/// Quantizer policy
///
/// The source's global settings as one documented structure rather than
/// scattered literals.
#[derive(Debug, Clone)]
pub struct QuantizerConfig {
    /// Fuse remaining MatMul+Add pairs before quantizing, so every
    /// eligible projection has a valid quantized kernel form
    pub force_fusions: bool,
    /// Symmetric-range weight scheme (the only supported scheme)
    pub symmetric_weights: bool,
    /// Skip weights smaller than this many elements
    pub min_elements: usize,
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self {
            force_fusions: true,
            symmetric_weights: true,
            min_elements: BLOCK_SIZE,
        }
    }
}

/// Converts optimized graphs to quantized graphs
pub struct GraphQuantizer {
    config: QuantizerConfig,
}

impl GraphQuantizer {
    /// Create a quantizer with the given policy
    #[must_use]
    pub fn new(config: QuantizerConfig) -> Self {
        Self { config }
    }

    /// Produce a quantized copy of an optimized graph
    ///
    /// Ports are untouched. Gemm nodes whose constant weight meets the
    /// size threshold become QGemm nodes over a Q8 initializer; the f32
    /// weight is dropped once unreferenced.
    ///
    /// # Errors
    ///
    /// Returns [`PortarError::Quantization`] on an unsupported scheme or
    /// a malformed graph. Failures are per-role; callers continue with
    /// the other roles.
    pub fn quantize(&self, role: Role, graph: &PortGraph) -> Result<PortGraph> {
        if !self.config.symmetric_weights {
            return Err(PortarError::Quantization {
                role,
                reason: "asymmetric weight quantization is not supported".to_string(),
            });
        }

        let mut quantized = graph.clone();
        let signature = graph.port_signature();

        if self.config.force_fusions {
            FuseMatMulAdd
                .run(&mut quantized)
                .map_err(|e| PortarError::Quantization {
                    role,
                    reason: format!("forced fusion failed: {e}"),
                })?;
        }

        let mut converted = 0usize;
        for ix in quantized.node_indices() {
            if !matches!(quantized.node(ix), Some(Op::Gemm)) {
                continue;
            }
            let inputs = quantized.node_inputs(ix);
            if inputs.len() != 3 {
                return Err(PortarError::Quantization {
                    role,
                    reason: "Gemm node with malformed inputs".to_string(),
                });
            }
            let (x_ix, w_ix, b_ix) = (inputs[0].0, inputs[1].0, inputs[2].0);

            let weight_name = match quantized.node(w_ix) {
                Some(Op::Constant { name }) => name.clone(),
                _ => continue,
            };
            let weight = match quantized.initializer(&weight_name) {
                Some(TensorPayload::F32 { tensor })
                    if tensor.size() >= self.config.min_elements =>
                {
                    tensor.clone()
                }
                _ => continue,
            };

            let (scales, quants) = quantize_tensor(&weight);
            let q_name = format!("{weight_name}.q8");
            quantized.set_initializer(
                &q_name,
                TensorPayload::Q8 {
                    shape: weight.shape().to_vec(),
                    scales,
                    quants,
                },
            );
            let q_const = quantized.add_node(Op::Constant { name: q_name });

            quantized.clear_node_inputs(ix);
            if let Some(node) = quantized.node_mut(ix) {
                *node = Op::QGemm;
            }
            quantized.add_edge(x_ix, ix, 0);
            quantized.add_edge(q_const, ix, 1);
            quantized.add_edge(b_ix, ix, 2);
            converted += 1;
            debug!(role = %role, weight = %weight_name, "quantized Gemm weight");
        }

        // drop f32 weights that lost their last consumer
        PruneDeadNodes
            .run(&mut quantized)
            .map_err(|e| PortarError::Quantization {
                role,
                reason: format!("post-quantization pruning failed: {e}"),
            })?;

        if quantized.port_signature() != signature {
            return Err(PortarError::Quantization {
                role,
                reason: "quantization altered the port signature".to_string(),
            });
        }

        info!(role = %role, converted, "quantized");
        Ok(quantized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{
        AxisDim, DType, GraphExecutor, PortSpec, TensorValue, AXIS_BATCH,
    };
    use crate::optimize::{GraphOptimizer, OptimizerConfig};

    #[test]
    fn test_q8_block_roundtrip_error_bounded() {
        let values: Vec<f32> = (0..32).map(|i| (i as f32 - 16.0) * 0.1).collect();
        let block = Q8Block::quantize(&values);
        // error bounded by half a quantization step
        let bound = block.scale * 0.5 + 1e-6;
        assert!(block.quantization_error(&values) <= bound);
    }

    #[test]
    fn test_q8_block_max_maps_to_127() {
        let mut values = [0.0f32; 32];
        values[7] = 2.0;
        let block = Q8Block::quantize(&values);
        assert_eq!(block.quants[7], 127);
        assert!((block.scale - 2.0 / 127.0).abs() < 1e-9);
    }

    #[test]
    fn test_q8_block_near_zero_uses_floor_scale() {
        let values = [0.0f32; 32];
        let block = Q8Block::quantize(&values);
        assert!(block.scale > 0.0);
        assert!(block.quants.iter().all(|&q| q == 0));
    }

    #[test]
    fn test_quantize_tensor_pads_last_block() {
        let tensor = Tensor::from_vec(vec![5, 7], vec![0.5; 35]).unwrap();
        let (scales, quants) = quantize_tensor(&tensor);
        assert_eq!(scales.len(), 2);
        assert_eq!(quants.len(), 64);

        let back = dequantize_q8(&scales, &quants, &[5, 7]).unwrap();
        assert_eq!(back.size(), 35);
        for (a, b) in back.data().iter().zip(tensor.data().iter()) {
            assert!((a - b).abs() < 0.5 / 127.0 + 1e-6);
        }
    }

    #[test]
    fn test_dequantize_rejects_short_payload() {
        assert!(dequantize_q8(&[1.0], &[0; 32], &[2, 32]).is_err());
    }

    /// x @ Transpose(W) + b as a traced linear, optimized into a Gemm
    fn optimized_linear() -> PortGraph {
        let mut g = PortGraph::new();
        let x = g.add_node(Op::Input {
            name: "x".to_string(),
        });
        let w = g.add_node(Op::Constant {
            name: "w".to_string(),
        });
        let b = g.add_node(Op::Constant {
            name: "b".to_string(),
        });
        let wt = g.add_node(Op::Transpose { perm: vec![1, 0] });
        let mm = g.add_node(Op::MatMul);
        let add = g.add_node(Op::Add);
        g.add_edge(w, wt, 0);
        g.add_edge(x, mm, 0);
        g.add_edge(wt, mm, 1);
        g.add_edge(mm, add, 0);
        g.add_edge(b, add, 1);

        let weight: Vec<f32> = (0..64 * 32).map(|i| ((i % 13) as f32 - 6.0) * 0.05).collect();
        g.add_initializer(
            "w",
            TensorPayload::F32 {
                tensor: Tensor::from_vec(vec![64, 32], weight).unwrap(),
            },
        )
        .unwrap();
        g.add_initializer(
            "b",
            TensorPayload::F32 {
                tensor: Tensor::zeros(vec![64]).unwrap(),
            },
        )
        .unwrap();
        g.push_input(
            PortSpec {
                name: "x".to_string(),
                dtype: DType::F32,
                axes: vec![AxisDim::Symbolic(AXIS_BATCH.to_string()), AxisDim::Fixed(32)],
            },
            x,
        );
        g.push_output(
            PortSpec {
                name: "y".to_string(),
                dtype: DType::F32,
                axes: vec![AxisDim::Symbolic(AXIS_BATCH.to_string()), AxisDim::Fixed(64)],
            },
            add,
        );

        GraphOptimizer::new(&OptimizerConfig::default())
            .optimize(Role::LmHead, &g)
            .unwrap()
    }

    #[test]
    fn test_quantize_graph_rewrites_gemm() {
        let g = optimized_linear();
        let quantizer = GraphQuantizer::new(QuantizerConfig::default());
        let q = quantizer.quantize(Role::LmHead, &g).unwrap();

        assert!(q
            .node_indices()
            .into_iter()
            .any(|ix| matches!(q.node(ix), Some(Op::QGemm))));
        assert!(!q
            .node_indices()
            .into_iter()
            .any(|ix| matches!(q.node(ix), Some(Op::Gemm))));
        assert_eq!(q.port_signature(), g.port_signature());

        // quantized payload present, f32 weight pruned
        let has_q8 = q
            .initializers()
            .values()
            .any(|p| matches!(p, TensorPayload::Q8 { .. }));
        assert!(has_q8);
    }

    #[test]
    fn test_quantized_graph_close_to_float() {
        let g = optimized_linear();
        let q = GraphQuantizer::new(QuantizerConfig::default())
            .quantize(Role::LmHead, &g)
            .unwrap();

        let x = TensorValue::F32(Tensor::filled(vec![1, 32], 1.0).unwrap());
        let float_out = GraphExecutor::new(&g)
            .run(&[("x".to_string(), x.clone())])
            .unwrap();
        let quant_out = GraphExecutor::new(&q)
            .run(&[("x".to_string(), x)])
            .unwrap();

        let a = float_out["y"].as_f32().unwrap();
        let b = quant_out["y"].as_f32().unwrap();
        // deliberately looser than the verifier: quantization trades
        // fidelity for size
        for (x, y) in a.data().iter().zip(b.data().iter()) {
            assert!((x - y).abs() < 0.1, "{x} vs {y}");
        }
    }

    #[test]
    fn test_small_weights_stay_float() {
        let g = optimized_linear();
        let quantizer = GraphQuantizer::new(QuantizerConfig {
            min_elements: 1_000_000,
            ..QuantizerConfig::default()
        });
        let q = quantizer.quantize(Role::LmHead, &g).unwrap();
        assert!(!q
            .node_indices()
            .into_iter()
            .any(|ix| matches!(q.node(ix), Some(Op::QGemm))));
    }

    #[test]
    fn test_asymmetric_scheme_rejected() {
        let g = optimized_linear();
        let quantizer = GraphQuantizer::new(QuantizerConfig {
            symmetric_weights: false,
            ..QuantizerConfig::default()
        });
        let err = quantizer.quantize(Role::Encoder, &g).unwrap_err();
        assert!(matches!(err, PortarError::Quantization { .. }));
    }
}
