//! Graph tracing
//!
//! A [`Tracer`] records one static graph while evaluating it eagerly:
//! every op method appends a node, runs the shared kernel on the operands'
//! current values, and returns a [`TraceId`] handle. Recording and
//! evaluation stay in lockstep, so shape errors surface at trace time with
//! the role attached.
//!
//! Tracing is deterministic given fixed weights and fixed example-input
//! shapes. All built-in ops are data-independent; a submodule whose
//! control flow would depend on tensor *values* must call
//! [`Tracer::flag_dynamic`], which fails the export instead of silently
//! baking one branch into the artifact.

use std::collections::BTreeMap;

use petgraph::stable_graph::NodeIndex;

use crate::error::{PortarError, Result};
use crate::layers::{Activation, FeedForward, LayerNorm, Linear, MultiHeadAttention};
use crate::ops;
use crate::tensor::Tensor;

use super::artifact::Role;
use super::exec::TensorValue;
use super::ir::{AxisDim, Op, PortGraph, PortSpec, TensorPayload};

/// Handle to a traced tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceId(NodeIndex);

/// Records a static graph while evaluating it eagerly
pub struct Tracer {
    role: Role,
    graph: PortGraph,
    values: BTreeMap<NodeIndex, TensorValue>,
    const_nodes: BTreeMap<String, NodeIndex>,
}

impl Tracer {
    /// Start tracing a submodule
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            graph: PortGraph::new(),
            values: BTreeMap::new(),
            const_nodes: BTreeMap::new(),
        }
    }

    /// The role being traced
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Declare a graph input bound to an example value
    ///
    /// # Errors
    ///
    /// Returns error if the example value doesn't satisfy the port spec.
    pub fn input(&mut self, spec: PortSpec, value: TensorValue) -> Result<TraceId> {
        if value.dtype() != spec.dtype {
            return Err(self.fail(format!(
                "Example input '{}' dtype mismatch",
                spec.name
            )));
        }
        spec.validate_shape(value.shape())
            .map_err(|e| self.fail(e.to_string()))?;

        let node = self.graph.add_node(Op::Input {
            name: spec.name.clone(),
        });
        self.graph.push_input(spec, node);
        self.values.insert(node, value);
        Ok(TraceId(node))
    }

    /// Register a constant weight, deduplicated by name
    ///
    /// # Errors
    ///
    /// Returns error if the same name was registered with different data.
    pub fn constant(&mut self, name: &str, tensor: &Tensor<f32>) -> Result<TraceId> {
        if let Some(&node) = self.const_nodes.get(name) {
            return Ok(TraceId(node));
        }
        self.graph
            .add_initializer(
                name,
                TensorPayload::F32 {
                    tensor: tensor.clone(),
                },
            )
            .map_err(|e| self.fail(e.to_string()))?;
        let node = self.graph.add_node(Op::Constant {
            name: name.to_string(),
        });
        self.const_nodes.insert(name.to_string(), node);
        self.values.insert(node, TensorValue::F32(tensor.clone()));
        Ok(TraceId(node))
    }

    /// Declare a named output port
    ///
    /// Binding an input's `TraceId` directly makes the port a passthrough:
    /// same node, same value, same identity. This is the convention cross-attention
    /// cache slots rely on.
    pub fn output(&mut self, name: &str, id: TraceId, axes: Vec<AxisDim>) {
        let dtype = self.values[&id.0].dtype();
        self.graph.push_output(
            PortSpec {
                name: name.to_string(),
                dtype,
                axes,
            },
            id.0,
        );
    }

    /// Current value of a traced tensor
    #[must_use]
    pub fn value(&self, id: TraceId) -> &TensorValue {
        &self.values[&id.0]
    }

    /// Shape of a traced tensor
    #[must_use]
    pub fn shape(&self, id: TraceId) -> &[usize] {
        self.values[&id.0].shape()
    }

    /// Fail the export: the traced region depends on tensor values
    ///
    /// Data-dependent control flow cannot be captured in a static graph;
    /// flagging it is mandatory, baking in one branch is not an option.
    #[must_use]
    pub fn flag_dynamic(&self, reason: &str) -> PortarError {
        self.fail(format!("data-dependent control flow: {reason}"))
    }

    /// Finish tracing and yield the recorded graph
    #[must_use]
    pub fn finish(self) -> PortGraph {
        self.graph
    }

    fn fail(&self, reason: String) -> PortarError {
        PortarError::TraceExport {
            role: self.role,
            reason,
        }
    }

    fn f32_value(&self, id: TraceId) -> Result<&Tensor<f32>> {
        self.values[&id.0]
            .as_f32()
            .map_err(|e| self.fail(e.to_string()))
    }

    fn record(&mut self, op: Op, inputs: &[TraceId], value: Tensor<f32>) -> TraceId {
        let node = self.graph.add_node(op);
        for (slot, input) in inputs.iter().enumerate() {
            self.graph.add_edge(input.0, node, slot);
        }
        self.values.insert(node, TensorValue::F32(value));
        TraceId(node)
    }

    // ------------------------------------------------------------------
    // Primitive ops
    // ------------------------------------------------------------------

    /// Embedding lookup
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn gather(&mut self, table: TraceId, ids: TraceId) -> Result<TraceId> {
        let ids_tensor = self.values[&ids.0]
            .as_u32()
            .map_err(|e| self.fail(e.to_string()))?;
        let value = ops::gather(self.f32_value(table)?, ids_tensor)
            .map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::Gather, &[table, ids], value))
    }

    /// Add position-table rows at a fixed offset
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn add_position(&mut self, x: TraceId, table: TraceId, offset: usize) -> Result<TraceId> {
        let value = ops::add_position(self.f32_value(x)?, self.f32_value(table)?, offset)
            .map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::AddPosition { offset }, &[x, table], value))
    }

    /// Add position-table rows at an offset read from `shape_src`'s
    /// sequence dimension (the incremental-decoding position)
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn add_position_at(
        &mut self,
        x: TraceId,
        table: TraceId,
        shape_src: TraceId,
    ) -> Result<TraceId> {
        let offset = self
            .f32_value(shape_src)?
            .dim(2)
            .map_err(|e| self.fail(e.to_string()))?;
        let value = ops::add_position(self.f32_value(x)?, self.f32_value(table)?, offset)
            .map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::AddPositionAt, &[x, table, shape_src], value))
    }

    /// Permute axes
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn transpose(&mut self, x: TraceId, perm: &[usize]) -> Result<TraceId> {
        let value =
            ops::transpose(self.f32_value(x)?, perm).map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(
            Op::Transpose {
                perm: perm.to_vec(),
            },
            &[x],
            value,
        ))
    }

    /// Batched matrix multiplication
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn matmul(&mut self, a: TraceId, b: TraceId) -> Result<TraceId> {
        let value = ops::matmul(self.f32_value(a)?, self.f32_value(b)?)
            .map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::MatMul, &[a, b], value))
    }

    /// Elementwise or bias-broadcast addition
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn add(&mut self, a: TraceId, b: TraceId) -> Result<TraceId> {
        let value = ops::add(self.f32_value(a)?, self.f32_value(b)?)
            .map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::Add, &[a, b], value))
    }

    /// Multiply by a constant
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn scale(&mut self, x: TraceId, factor: f32) -> Result<TraceId> {
        let value =
            ops::scale(self.f32_value(x)?, factor).map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::Scale { factor }, &[x], value))
    }

    /// Softmax over the last axis
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn softmax(&mut self, x: TraceId) -> Result<TraceId> {
        let value =
            crate::layers::softmax(self.f32_value(x)?).map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::Softmax, &[x], value))
    }

    /// Activation function
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn activation(&mut self, act: Activation, x: TraceId) -> Result<TraceId> {
        let value = act
            .apply(self.f32_value(x)?)
            .map_err(|e| self.fail(e.to_string()))?;
        let op = match act {
            Activation::Relu => Op::Relu,
            Activation::Gelu => Op::Gelu,
        };
        Ok(self.record(op, &[x], value))
    }

    /// Split into attention heads
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn split_heads(&mut self, x: TraceId, heads: usize) -> Result<TraceId> {
        let value = ops::split_heads(self.f32_value(x)?, heads)
            .map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::SplitHeads { heads }, &[x], value))
    }

    /// Merge attention heads
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn merge_heads(&mut self, x: TraceId) -> Result<TraceId> {
        let value =
            ops::merge_heads(self.f32_value(x)?).map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::MergeHeads, &[x], value))
    }

    /// Concatenate along an axis
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn concat(&mut self, a: TraceId, b: TraceId, axis: usize) -> Result<TraceId> {
        let value = ops::concat(self.f32_value(a)?, self.f32_value(b)?, axis)
            .map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::Concat { axis }, &[a, b], value))
    }

    /// Additive causal mask
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn causal_mask(&mut self, scores: TraceId) -> Result<TraceId> {
        let value = ops::causal_mask_add(self.f32_value(scores)?)
            .map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::CausalMask, &[scores], value))
    }

    /// Additive padding mask
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn padding_mask(&mut self, scores: TraceId, mask: TraceId) -> Result<TraceId> {
        let value = ops::padding_mask_add(self.f32_value(scores)?, self.f32_value(mask)?)
            .map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::PaddingMask, &[scores, mask], value))
    }

    /// Layer normalization with constant parameters
    ///
    /// # Errors
    ///
    /// Returns a trace error if the kernel rejects the operands.
    pub fn layer_norm(
        &mut self,
        x: TraceId,
        weight: TraceId,
        bias: TraceId,
        eps: f32,
    ) -> Result<TraceId> {
        let value = crate::layers::layer_norm(
            self.f32_value(x)?,
            self.f32_value(weight)?.data(),
            self.f32_value(bias)?.data(),
            eps,
        )
        .map_err(|e| self.fail(e.to_string()))?;
        Ok(self.record(Op::LayerNorm { eps }, &[x, weight, bias], value))
    }

    // ------------------------------------------------------------------
    // Layer compositions, mirroring the eager forwards exactly
    // ------------------------------------------------------------------

    /// Trace a linear layer: `x @ W.T + b`
    ///
    /// Emits the transpose of the stored `[out, in]` weight as a graph op;
    /// constant folding later collapses it into a folded initializer.
    ///
    /// # Errors
    ///
    /// Returns a trace error on shape mismatch.
    pub fn linear(&mut self, x: TraceId, layer: &Linear, name: &str) -> Result<TraceId> {
        let weight = self.constant(&format!("{name}.weight"), layer.weight())?;
        let bias = self.constant(&format!("{name}.bias"), layer.bias())?;
        let w_t = self.transpose(weight, &[1, 0])?;
        let projected = self.matmul(x, w_t)?;
        self.add(projected, bias)
    }

    /// Trace a layer norm with its learned parameters
    ///
    /// # Errors
    ///
    /// Returns a trace error on shape mismatch.
    pub fn layer_norm_layer(
        &mut self,
        x: TraceId,
        norm: &LayerNorm,
        name: &str,
    ) -> Result<TraceId> {
        let weight = self.constant(&format!("{name}.weight"), norm.weight())?;
        let bias = self.constant(&format!("{name}.bias"), norm.bias())?;
        self.layer_norm(x, weight, bias, norm.eps())
    }

    /// Trace K/V head projections, mirroring
    /// [`MultiHeadAttention::project_kv`]
    ///
    /// # Errors
    ///
    /// Returns a trace error on shape mismatch.
    pub fn attention_kv(
        &mut self,
        source: TraceId,
        mha: &MultiHeadAttention,
        name: &str,
    ) -> Result<(TraceId, TraceId)> {
        let k_flat = self.linear(source, mha.k_proj(), &format!("{name}.k_proj"))?;
        let k = self.split_heads(k_flat, mha.num_heads())?;
        let v_flat = self.linear(source, mha.v_proj(), &format!("{name}.v_proj"))?;
        let v = self.split_heads(v_flat, mha.num_heads())?;
        Ok((k, v))
    }

    /// Trace attention over pre-projected K/V, mirroring
    /// [`MultiHeadAttention::attend`]
    ///
    /// # Errors
    ///
    /// Returns a trace error on shape mismatch.
    pub fn attention(
        &mut self,
        query_src: TraceId,
        keys: TraceId,
        values: TraceId,
        mha: &MultiHeadAttention,
        causal: bool,
        padding_mask: Option<TraceId>,
        name: &str,
    ) -> Result<TraceId> {
        let q_flat = self.linear(query_src, mha.q_proj(), &format!("{name}.q_proj"))?;
        let q = self.split_heads(q_flat, mha.num_heads())?;
        let q = self.scale(q, mha.scale())?;

        let k_t = self.transpose(keys, &[0, 1, 3, 2])?;
        let mut scores = self.matmul(q, k_t)?;
        if causal {
            scores = self.causal_mask(scores)?;
        }
        if let Some(mask) = padding_mask {
            scores = self.padding_mask(scores, mask)?;
        }

        let weights = self.softmax(scores)?;
        let context = self.matmul(weights, values)?;
        let merged = self.merge_heads(context)?;
        self.linear(merged, mha.out_proj(), &format!("{name}.out_proj"))
    }

    /// Trace a feed-forward block, mirroring [`FeedForward::forward`]
    ///
    /// # Errors
    ///
    /// Returns a trace error on shape mismatch.
    pub fn feed_forward(&mut self, x: TraceId, ffn: &FeedForward, name: &str) -> Result<TraceId> {
        let hidden = self.linear(x, ffn.up(), &format!("{name}.up"))?;
        let activated = self.activation(ffn.activation(), hidden)?;
        self.linear(activated, ffn.down(), &format!("{name}.down"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::exec::GraphExecutor;
    use crate::graph::ir::{DType, AXIS_BATCH};

    fn batch_spec(name: &str, dtype: DType, tail: Vec<AxisDim>) -> PortSpec {
        let mut axes = vec![AxisDim::Symbolic(AXIS_BATCH.to_string())];
        axes.extend(tail);
        PortSpec {
            name: name.to_string(),
            dtype,
            axes,
        }
    }

    #[test]
    fn test_trace_records_and_evaluates() {
        let mut t = Tracer::new(Role::LmHead);
        let x = t
            .input(
                batch_spec("input", DType::F32, vec![AxisDim::Fixed(2)]),
                TensorValue::F32(Tensor::from_vec(vec![1, 2], vec![1.0, 2.0]).unwrap()),
            )
            .unwrap();
        let doubled = t.scale(x, 2.0).unwrap();
        assert_eq!(t.value(doubled).as_f32().unwrap().data(), &[2.0, 4.0]);
        t.output("output", doubled, vec![
            AxisDim::Symbolic(AXIS_BATCH.to_string()),
            AxisDim::Fixed(2),
        ]);

        let graph = t.finish();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.outputs().len(), 1);
    }

    #[test]
    fn test_constant_dedup() {
        let mut t = Tracer::new(Role::Encoder);
        let w = Tensor::ones(vec![2]).unwrap();
        let a = t.constant("shared", &w).unwrap();
        let b = t.constant("shared", &w).unwrap();
        assert_eq!(a, b);
        assert_eq!(t.finish().node_count(), 1);
    }

    #[test]
    fn test_traced_linear_matches_eager() {
        let layer = Linear::new(
            Tensor::from_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
            Tensor::from_vec(vec![2], vec![0.5, -0.5]).unwrap(),
        )
        .unwrap();
        let x = Tensor::from_vec(vec![1, 1, 3], vec![1.0, 1.0, 1.0]).unwrap();
        let eager = layer.forward(&x).unwrap();

        let mut t = Tracer::new(Role::LmHead);
        let x_id = t
            .input(
                batch_spec(
                    "input",
                    DType::F32,
                    vec![AxisDim::Fixed(1), AxisDim::Fixed(3)],
                ),
                TensorValue::F32(x),
            )
            .unwrap();
        let y = t.linear(x_id, &layer, "proj").unwrap();
        assert_eq!(t.value(y).as_f32().unwrap(), &eager);
        t.output("output", y, vec![
            AxisDim::Symbolic(AXIS_BATCH.to_string()),
            AxisDim::Fixed(1),
            AxisDim::Fixed(2),
        ]);

        // executing the recorded graph reproduces the eager value
        let graph = t.finish();
        let exec = GraphExecutor::new(&graph);
        let out = exec
            .run(&[(
                "input".to_string(),
                TensorValue::F32(
                    Tensor::from_vec(vec![1, 1, 3], vec![1.0, 1.0, 1.0]).unwrap(),
                ),
            )])
            .unwrap();
        assert_eq!(out["output"].as_f32().unwrap(), &eager);
    }

    #[test]
    fn test_flag_dynamic_is_trace_error() {
        let t = Tracer::new(Role::Decoder);
        let err = t.flag_dynamic("branch on token value");
        assert!(matches!(err, PortarError::TraceExport { role: Role::Decoder, .. }));
        assert!(err.to_string().contains("data-dependent"));
    }

    #[test]
    fn test_shape_error_carries_role() {
        let mut t = Tracer::new(Role::DecoderCached);
        let a = t
            .input(
                batch_spec("a", DType::F32, vec![AxisDim::Fixed(2)]),
                TensorValue::F32(Tensor::zeros(vec![1, 2]).unwrap()),
            )
            .unwrap();
        let b = t
            .input(
                batch_spec("b", DType::F32, vec![AxisDim::Fixed(3)]),
                TensorValue::F32(Tensor::zeros(vec![1, 3]).unwrap()),
            )
            .unwrap();
        let err = t.add(a, b).unwrap_err();
        assert!(matches!(
            err,
            PortarError::TraceExport {
                role: Role::DecoderCached,
                ..
            }
        ));
    }
}
