//! Graph execution
//!
//! Interprets a [`PortGraph`] on concrete named inputs: topological walk,
//! one kernel dispatch per node, outputs collected by port name. This is
//! the second computation path the verifier compares against the eager
//! layers; both dispatch to the same kernels in [`crate::ops`].
//!
//! Dynamic shapes come for free: kernels derive every size from their
//! runtime inputs, and port validation only pins rank and fixed axes, so
//! a graph exported at batch 2 / length 8 runs at batch 5 / length 13.

use std::collections::BTreeMap;

use petgraph::stable_graph::NodeIndex;

use crate::error::{PortarError, Result};
use crate::layers;
use crate::ops;
use crate::quantize;
use crate::tensor::Tensor;

use super::ir::{DType, Op, PortGraph, TensorPayload};

/// A runtime tensor value flowing through the graph
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    /// 32-bit float tensor
    F32(Tensor<f32>),
    /// 32-bit unsigned integer tensor (token ids)
    U32(Tensor<u32>),
}

impl TensorValue {
    /// Shape of the contained tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            TensorValue::F32(t) => t.shape(),
            TensorValue::U32(t) => t.shape(),
        }
    }

    /// Element type
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::F32(_) => DType::F32,
            TensorValue::U32(_) => DType::U32,
        }
    }

    /// Borrow as f32 tensor
    ///
    /// # Errors
    ///
    /// Returns error if the value is not f32.
    pub fn as_f32(&self) -> Result<&Tensor<f32>> {
        match self {
            TensorValue::F32(t) => Ok(t),
            TensorValue::U32(_) => Err(PortarError::Execution {
                reason: "Expected f32 tensor, got u32".to_string(),
            }),
        }
    }

    /// Borrow as u32 tensor
    ///
    /// # Errors
    ///
    /// Returns error if the value is not u32.
    pub fn as_u32(&self) -> Result<&Tensor<u32>> {
        match self {
            TensorValue::U32(t) => Ok(t),
            TensorValue::F32(_) => Err(PortarError::Execution {
                reason: "Expected u32 tensor, got f32".to_string(),
            }),
        }
    }
}

/// Interpreter over a [`PortGraph`]
pub struct GraphExecutor<'a> {
    graph: &'a PortGraph,
}

impl<'a> GraphExecutor<'a> {
    /// Create an executor over a graph
    #[must_use]
    pub fn new(graph: &'a PortGraph) -> Self {
        Self { graph }
    }

    /// Execute the graph on named inputs, returning named outputs
    ///
    /// Every provided input must match a declared port's dtype, rank, and
    /// fixed axes. A declared input with no consumers may be omitted (the
    /// cached decoder declares `encoder_hidden_states` for interface
    /// symmetry without consuming it).
    ///
    /// # Errors
    ///
    /// Returns error on unknown or missing inputs, port validation
    /// failure, or any kernel error.
    pub fn run(
        &self,
        inputs: &[(String, TensorValue)],
    ) -> Result<BTreeMap<String, TensorValue>> {
        let mut provided: BTreeMap<&str, &TensorValue> = BTreeMap::new();
        for (name, value) in inputs {
            if provided.insert(name.as_str(), value).is_some() {
                return Err(PortarError::Execution {
                    reason: format!("Input '{name}' provided twice"),
                });
            }
        }

        let declared: Vec<&str> = self
            .graph
            .inputs()
            .iter()
            .map(|(spec, _)| spec.name.as_str())
            .collect();
        for name in provided.keys() {
            if !declared.contains(name) {
                return Err(PortarError::Execution {
                    reason: format!("Unknown input '{name}'"),
                });
            }
        }

        let mut values: BTreeMap<NodeIndex, TensorValue> = BTreeMap::new();
        for (spec, node) in self.graph.inputs() {
            match provided.get(spec.name.as_str()) {
                Some(value) => {
                    if value.dtype() != spec.dtype {
                        return Err(PortarError::Execution {
                            reason: format!(
                                "Input '{}' has wrong dtype: expected {:?}, got {:?}",
                                spec.name,
                                spec.dtype,
                                value.dtype()
                            ),
                        });
                    }
                    spec.validate_shape(value.shape())?;
                    values.insert(*node, (*value).clone());
                }
                None => {
                    if !self.graph.consumers(*node).is_empty() {
                        return Err(PortarError::Execution {
                            reason: format!("Missing required input '{}'", spec.name),
                        });
                    }
                }
            }
        }

        for ix in self.graph.topo_order()? {
            let op = self
                .graph
                .node(ix)
                .ok_or_else(|| PortarError::Execution {
                    reason: "Topological order references missing node".to_string(),
                })?
                .clone();

            match op {
                Op::Input { .. } => {
                    // bound above, or legitimately absent when unused
                }
                Op::Constant { ref name } => {
                    match self.lookup_initializer(name)? {
                        TensorPayload::F32 { tensor } => {
                            values.insert(ix, TensorValue::F32(tensor.clone()));
                        }
                        // Q8 payloads are consumed in place by QGemm; they
                        // never materialize as standalone values
                        TensorPayload::Q8 { .. } => {}
                    }
                }
                _ => {
                    let value = self.eval_op(&op, ix, &values)?;
                    values.insert(ix, value);
                }
            }
        }

        let mut outputs = BTreeMap::new();
        for (spec, node) in self.graph.outputs() {
            let value = values.get(node).ok_or_else(|| PortarError::Execution {
                reason: format!("Output '{}' was never computed", spec.name),
            })?;
            outputs.insert(spec.name.clone(), value.clone());
        }
        Ok(outputs)
    }

    fn lookup_initializer(&self, name: &str) -> Result<&TensorPayload> {
        self.graph
            .initializer(name)
            .ok_or_else(|| PortarError::Execution {
                reason: format!("Missing initializer '{name}'"),
            })
    }

    fn input_values<'v>(
        &self,
        ix: NodeIndex,
        values: &'v BTreeMap<NodeIndex, TensorValue>,
    ) -> Result<Vec<&'v TensorValue>> {
        let mut out = Vec::new();
        for (src, _) in self.graph.node_inputs(ix) {
            let value = values.get(&src).ok_or_else(|| PortarError::Execution {
                reason: format!(
                    "Operand of {} not computed (consumed an unbound input?)",
                    self.graph.node(ix).map_or("?", Op::kind)
                ),
            })?;
            out.push(value);
        }
        Ok(out)
    }

    fn eval_op(
        &self,
        op: &Op,
        ix: NodeIndex,
        values: &BTreeMap<NodeIndex, TensorValue>,
    ) -> Result<TensorValue> {
        let arity_err = |expected: usize, got: usize| PortarError::Execution {
            reason: format!("{} expects {expected} inputs, got {got}", op.kind()),
        };

        // QGemm reads its weight operand straight from the initializer
        // table, so handle it before generic operand resolution.
        if let Op::QGemm = op {
            let input_nodes = self.graph.node_inputs(ix);
            if input_nodes.len() != 3 {
                return Err(arity_err(3, input_nodes.len()));
            }
            let x = values
                .get(&input_nodes[0].0)
                .ok_or_else(|| PortarError::Execution {
                    reason: "QGemm input not computed".to_string(),
                })?
                .as_f32()?;
            let weight_name = match self.graph.node(input_nodes[1].0) {
                Some(Op::Constant { name }) => name.clone(),
                _ => {
                    return Err(PortarError::Execution {
                        reason: "QGemm weight must be a constant".to_string(),
                    })
                }
            };
            let weight = match self.lookup_initializer(&weight_name)? {
                TensorPayload::Q8 {
                    shape,
                    scales,
                    quants,
                } => quantize::dequantize_q8(scales, quants, shape)?,
                TensorPayload::F32 { .. } => {
                    return Err(PortarError::Execution {
                        reason: format!(
                            "QGemm weight '{weight_name}' is not quantized"
                        ),
                    })
                }
            };
            let bias = values
                .get(&input_nodes[2].0)
                .ok_or_else(|| PortarError::Execution {
                    reason: "QGemm bias not computed".to_string(),
                })?
                .as_f32()?;
            let projected = ops::matmul(x, &weight)?;
            return Ok(TensorValue::F32(ops::add(&projected, bias)?));
        }

        let operands = self.input_values(ix, values)?;

        // Gather mixes dtypes; everything else is pure f32
        if let Op::Gather = op {
            if operands.len() != 2 {
                return Err(arity_err(2, operands.len()));
            }
            let result = ops::gather(operands[0].as_f32()?, operands[1].as_u32()?)?;
            return Ok(TensorValue::F32(result));
        }

        let mut f32_operands = Vec::with_capacity(operands.len());
        for operand in &operands {
            f32_operands.push(operand.as_f32()?);
        }
        Ok(TensorValue::F32(eval_pure(op, &f32_operands)?))
    }
}

/// Evaluate one pure-f32 op on concrete operands
///
/// Shared by the executor and the constant-folding pass, which is what
/// guarantees a folded subexpression computes exactly what the executor
/// would have.
///
/// # Errors
///
/// Returns error on arity mismatch, non-pure ops (`Input`, `Constant`,
/// `Gather`, `QGemm`), or kernel failure.
pub(crate) fn eval_pure(op: &Op, operands: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
    let arity = |expected: usize| -> Result<()> {
        if operands.len() == expected {
            Ok(())
        } else {
            Err(PortarError::Execution {
                reason: format!(
                    "{} expects {expected} inputs, got {}",
                    op.kind(),
                    operands.len()
                ),
            })
        }
    };

    match op {
        Op::AddPosition { offset } => {
            arity(2)?;
            ops::add_position(operands[0], operands[1], *offset)
        }
        Op::AddPositionAt => {
            arity(3)?;
            let offset = operands[2].dim(2)?;
            ops::add_position(operands[0], operands[1], offset)
        }
        Op::Transpose { perm } => {
            arity(1)?;
            ops::transpose(operands[0], perm)
        }
        Op::MatMul => {
            arity(2)?;
            ops::matmul(operands[0], operands[1])
        }
        Op::Add => {
            arity(2)?;
            ops::add(operands[0], operands[1])
        }
        Op::Scale { factor } => {
            arity(1)?;
            ops::scale(operands[0], *factor)
        }
        Op::Softmax => {
            arity(1)?;
            layers::softmax(operands[0])
        }
        Op::LayerNorm { eps } => {
            arity(3)?;
            layers::layer_norm(operands[0], operands[1].data(), operands[2].data(), *eps)
        }
        Op::Relu => {
            arity(1)?;
            layers::relu(operands[0])
        }
        Op::Gelu => {
            arity(1)?;
            layers::gelu(operands[0])
        }
        Op::SplitHeads { heads } => {
            arity(1)?;
            ops::split_heads(operands[0], *heads)
        }
        Op::MergeHeads => {
            arity(1)?;
            ops::merge_heads(operands[0])
        }
        Op::Concat { axis } => {
            arity(2)?;
            ops::concat(operands[0], operands[1], *axis)
        }
        Op::CausalMask => {
            arity(1)?;
            ops::causal_mask_add(operands[0])
        }
        Op::PaddingMask => {
            arity(2)?;
            ops::padding_mask_add(operands[0], operands[1])
        }
        Op::Gemm => {
            arity(3)?;
            let projected = ops::matmul(operands[0], operands[1])?;
            ops::add(&projected, operands[2])
        }
        Op::Input { .. } | Op::Constant { .. } | Op::Gather | Op::QGemm => {
            Err(PortarError::Execution {
                reason: format!("{} is not a pure f32 op", op.kind()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ir::{AxisDim, PortSpec, AXIS_BATCH};

    fn f32_spec(name: &str, axes: Vec<AxisDim>) -> PortSpec {
        PortSpec {
            name: name.to_string(),
            dtype: DType::F32,
            axes,
        }
    }

    /// y = relu(x + bias)
    fn small_graph() -> PortGraph {
        let mut g = PortGraph::new();
        let x = g.add_node(Op::Input {
            name: "x".to_string(),
        });
        let bias = g.add_node(Op::Constant {
            name: "bias".to_string(),
        });
        let sum = g.add_node(Op::Add);
        let act = g.add_node(Op::Relu);
        g.add_edge(x, sum, 0);
        g.add_edge(bias, sum, 1);
        g.add_edge(sum, act, 0);
        g.add_initializer(
            "bias",
            TensorPayload::F32 {
                tensor: Tensor::from_vec(vec![2], vec![1.0, -10.0]).unwrap(),
            },
        )
        .unwrap();
        g.push_input(
            f32_spec(
                "x",
                vec![AxisDim::Symbolic(AXIS_BATCH.to_string()), AxisDim::Fixed(2)],
            ),
            x,
        );
        g.push_output(
            f32_spec(
                "y",
                vec![AxisDim::Symbolic(AXIS_BATCH.to_string()), AxisDim::Fixed(2)],
            ),
            act,
        );
        g
    }

    #[test]
    fn test_run_small_graph() {
        let g = small_graph();
        let exec = GraphExecutor::new(&g);
        let x = TensorValue::F32(Tensor::from_vec(vec![1, 2], vec![2.0, 3.0]).unwrap());
        let out = exec.run(&[("x".to_string(), x)]).unwrap();
        assert_eq!(out["y"].as_f32().unwrap().data(), &[3.0, 0.0]);
    }

    #[test]
    fn test_symbolic_batch_accepts_any_size() {
        let g = small_graph();
        let exec = GraphExecutor::new(&g);
        let x = TensorValue::F32(Tensor::zeros(vec![7, 2]).unwrap());
        assert!(exec.run(&[("x".to_string(), x)]).is_ok());
    }

    #[test]
    fn test_fixed_axis_mismatch_rejected() {
        let g = small_graph();
        let exec = GraphExecutor::new(&g);
        let x = TensorValue::F32(Tensor::zeros(vec![1, 3]).unwrap());
        assert!(exec.run(&[("x".to_string(), x)]).is_err());
    }

    #[test]
    fn test_missing_consumed_input_rejected() {
        let g = small_graph();
        let exec = GraphExecutor::new(&g);
        assert!(exec.run(&[]).is_err());
    }

    #[test]
    fn test_unknown_input_rejected() {
        let g = small_graph();
        let exec = GraphExecutor::new(&g);
        let x = TensorValue::F32(Tensor::zeros(vec![1, 2]).unwrap());
        let result = exec.run(&[
            ("x".to_string(), x.clone()),
            ("mystery".to_string(), x),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unused_declared_input_may_be_omitted() {
        let mut g = small_graph();
        // declare an input nothing consumes
        let unused = g.add_node(Op::Input {
            name: "unused".to_string(),
        });
        g.push_input(
            f32_spec("unused", vec![AxisDim::Symbolic(AXIS_BATCH.to_string())]),
            unused,
        );

        let exec = GraphExecutor::new(&g);
        let x = TensorValue::F32(Tensor::zeros(vec![1, 2]).unwrap());
        assert!(exec.run(&[("x".to_string(), x)]).is_ok());
    }

    #[test]
    fn test_input_passthrough_to_output() {
        // output port bound directly to an input node, the cache
        // passthrough pattern
        let mut g = PortGraph::new();
        let x = g.add_node(Op::Input {
            name: "x".to_string(),
        });
        g.push_input(f32_spec("x", vec![AxisDim::Fixed(2)]), x);
        g.push_output(f32_spec("x", vec![AxisDim::Fixed(2)]), x);

        let exec = GraphExecutor::new(&g);
        let value = TensorValue::F32(Tensor::from_vec(vec![2], vec![4.0, 5.0]).unwrap());
        let out = exec.run(&[("x".to_string(), value.clone())]).unwrap();
        assert_eq!(out["x"], value);
    }
}
