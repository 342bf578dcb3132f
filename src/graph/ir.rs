//! Static computation graph representation
//!
//! A [`PortGraph`] is the traced form of one submodule: typed operation
//! nodes over a petgraph `StableGraph`, constant initializers (weights),
//! and named input/output ports with per-axis symbolic bindings. Stable
//! indices matter: optimization passes remove and rewrite nodes without
//! invalidating the indices ports refer to.
//!
//! The serialized form is [`GraphDoc`]: nodes in topological order with
//! slot-ordered input lists, which the executor and the file envelope
//! consume.

use std::collections::BTreeMap;

use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::{PortarError, Result};
use crate::tensor::Tensor;

/// Symbolic axis name for the batch dimension
pub const AXIS_BATCH: &str = "batch_size";

/// Symbolic axis name for the sequence dimension
pub const AXIS_SEQ: &str = "seq_length";

/// Graph operation
///
/// Every variant is shape-polymorphic and data-independent; the executor
/// dispatches each to the shared kernel in [`crate::ops`] or
/// [`crate::layers`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Graph input placeholder, bound by port name at execution time
    Input {
        /// Port name
        name: String,
    },
    /// Constant tensor, resolved from the initializer table
    Constant {
        /// Initializer name
        name: String,
    },
    /// Embedding lookup: `[table, ids]`
    Gather,
    /// Add rows of a position table at a fixed offset: `[x, table]`
    AddPosition {
        /// First table row to use
        offset: usize,
    },
    /// Add position-table rows at an offset read from the third input's
    /// sequence dimension (dim 2): `[x, table, shape_src]`
    AddPositionAt,
    /// Permute axes
    Transpose {
        /// Axis permutation
        perm: Vec<usize>,
    },
    /// Batched matrix multiplication
    MatMul,
    /// Elementwise or bias-broadcast addition
    Add,
    /// Multiply by a constant factor
    Scale {
        /// Scale factor
        factor: f32,
    },
    /// Softmax over the last axis
    Softmax,
    /// Layer normalization: `[x, weight, bias]`
    LayerNorm {
        /// Numerical stability epsilon
        eps: f32,
    },
    /// ReLU activation
    Relu,
    /// GELU activation (tanh approximation)
    Gelu,
    /// `[batch, seq, d_model]` → `[batch, heads, seq, d_k]`
    SplitHeads {
        /// Head count
        heads: usize,
    },
    /// `[batch, heads, seq, d_k]` → `[batch, seq, d_model]`
    MergeHeads,
    /// Concatenate two inputs along an axis
    Concat {
        /// Concatenation axis
        axis: usize,
    },
    /// Additive causal mask over rank-4 attention scores
    CausalMask,
    /// Additive padding mask: `[scores, mask]`
    PaddingMask,
    /// Fused linear: `[x, weight [in, out], bias]`, produced by the
    /// optimizer from MatMul + Add
    Gemm,
    /// Quantized fused linear: weight initializer holds Q8 blocks
    QGemm,
}

impl Op {
    /// Short operation name for diagnostics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Input { .. } => "Input",
            Op::Constant { .. } => "Constant",
            Op::Gather => "Gather",
            Op::AddPosition { .. } => "AddPosition",
            Op::AddPositionAt => "AddPositionAt",
            Op::Transpose { .. } => "Transpose",
            Op::MatMul => "MatMul",
            Op::Add => "Add",
            Op::Scale { .. } => "Scale",
            Op::Softmax => "Softmax",
            Op::LayerNorm { .. } => "LayerNorm",
            Op::Relu => "Relu",
            Op::Gelu => "Gelu",
            Op::SplitHeads { .. } => "SplitHeads",
            Op::MergeHeads => "MergeHeads",
            Op::Concat { .. } => "Concat",
            Op::CausalMask => "CausalMask",
            Op::PaddingMask => "PaddingMask",
            Op::Gemm => "Gemm",
            Op::QGemm => "QGemm",
        }
    }
}

/// Tensor element type at a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float
    F32,
    /// 32-bit unsigned integer (token ids)
    U32,
}

/// One axis of a port: fixed at export time or bound to a symbolic name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisDim {
    /// Size fixed at export time
    Fixed(usize),
    /// Size bound to a named symbolic variable (e.g. "batch_size")
    Symbolic(String),
}

/// Named input or output port with full-rank axis bindings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port name, the contract surface a caller binds by
    pub name: String,
    /// Element type
    pub dtype: DType,
    /// One entry per axis
    pub axes: Vec<AxisDim>,
}

impl PortSpec {
    /// Declared rank
    #[must_use]
    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    /// Check a concrete shape against the declared axes
    ///
    /// Symbolic axes accept any size; fixed axes must match exactly.
    /// Symbolic names are declarative metadata for the caller, not a
    /// runtime equality constraint across ports (cache history and source
    /// length share a name yet diverge during decoding).
    ///
    /// # Errors
    ///
    /// Returns error on rank or fixed-axis mismatch.
    pub fn validate_shape(&self, shape: &[usize]) -> Result<()> {
        if shape.len() != self.axes.len() {
            return Err(PortarError::Execution {
                reason: format!(
                    "Port '{}' expects rank {}, got shape {:?}",
                    self.name,
                    self.axes.len(),
                    shape
                ),
            });
        }
        for (axis, (dim, bound)) in shape.iter().zip(self.axes.iter()).enumerate() {
            if let AxisDim::Fixed(expected) = bound {
                if dim != expected {
                    return Err(PortarError::Execution {
                        reason: format!(
                            "Port '{}' axis {axis} is fixed at {expected}, got {dim}",
                            self.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Constant tensor data stored in a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorPayload {
    /// Full-precision tensor
    F32 {
        /// The tensor
        tensor: Tensor<f32>,
    },
    /// Symmetric block-quantized tensor (see [`crate::quantize`])
    Q8 {
        /// Logical shape
        shape: Vec<usize>,
        /// One scale per 32-element block
        scales: Vec<f32>,
        /// Quantized values, 32 per block, zero-padded in the last block
        quants: Vec<i8>,
    },
}

impl TensorPayload {
    /// Logical tensor shape
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            TensorPayload::F32 { tensor } => tensor.shape(),
            TensorPayload::Q8 { shape, .. } => shape,
        }
    }

    /// Logical element count
    #[must_use]
    pub fn size(&self) -> usize {
        self.shape().iter().product()
    }
}

/// A named port bound to a graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphPort {
    /// Port contract
    pub spec: PortSpec,
    /// Producing (output) or placeholder (input) node
    pub node: usize,
}

/// Static computation graph with named ports
#[derive(Debug, Clone, Default)]
pub struct PortGraph {
    /// Operation nodes; edge weight is the destination input slot
    graph: StableGraph<Op, usize>,
    /// Constant weights by name
    initializers: BTreeMap<String, TensorPayload>,
    /// Declared input ports
    inputs: Vec<(PortSpec, NodeIndex)>,
    /// Declared output ports
    outputs: Vec<(PortSpec, NodeIndex)>,
}

impl PortGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation node
    pub fn add_node(&mut self, op: Op) -> NodeIndex {
        self.graph.add_node(op)
    }

    /// Connect `src` output into `dst` input slot `slot`
    pub fn add_edge(&mut self, src: NodeIndex, dst: NodeIndex, slot: usize) {
        self.graph.add_edge(src, dst, slot);
    }

    /// Operation of a node
    #[must_use]
    pub fn node(&self, ix: NodeIndex) -> Option<&Op> {
        self.graph.node_weight(ix)
    }

    /// Mutable operation of a node
    pub fn node_mut(&mut self, ix: NodeIndex) -> Option<&mut Op> {
        self.graph.node_weight_mut(ix)
    }

    /// All node indices
    #[must_use]
    pub fn node_indices(&self) -> Vec<NodeIndex> {
        self.graph.node_indices().collect()
    }

    /// Number of nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Producers of a node's inputs, sorted by input slot
    #[must_use]
    pub fn node_inputs(&self, ix: NodeIndex) -> Vec<(NodeIndex, usize)> {
        let mut inputs: Vec<(NodeIndex, usize)> = self
            .graph
            .edges_directed(ix, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
            .collect();
        inputs.sort_by_key(|&(_, slot)| slot);
        inputs
    }

    /// Nodes consuming this node's output
    #[must_use]
    pub fn consumers(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(ix, Direction::Outgoing)
            .map(|e| e.target())
            .collect()
    }

    /// Remove a node and its edges
    pub fn remove_node(&mut self, ix: NodeIndex) {
        self.graph.remove_node(ix);
    }

    /// Drop all incoming edges of a node
    pub fn clear_node_inputs(&mut self, ix: NodeIndex) {
        let edges: Vec<_> = self
            .graph
            .edges_directed(ix, Direction::Incoming)
            .map(|e| e.id())
            .collect();
        for edge in edges {
            self.graph.remove_edge(edge);
        }
    }

    /// Register a constant initializer
    ///
    /// # Errors
    ///
    /// Returns error if the name is already taken.
    pub fn add_initializer(&mut self, name: &str, payload: TensorPayload) -> Result<()> {
        if self.initializers.contains_key(name) {
            return Err(PortarError::Format {
                reason: format!("Duplicate initializer '{name}'"),
            });
        }
        self.initializers.insert(name.to_string(), payload);
        Ok(())
    }

    /// Replace or insert an initializer (optimizer rewrites)
    pub fn set_initializer(&mut self, name: &str, payload: TensorPayload) {
        self.initializers.insert(name.to_string(), payload);
    }

    /// Remove an initializer
    pub fn remove_initializer(&mut self, name: &str) -> Option<TensorPayload> {
        self.initializers.remove(name)
    }

    /// Look up an initializer
    #[must_use]
    pub fn initializer(&self, name: &str) -> Option<&TensorPayload> {
        self.initializers.get(name)
    }

    /// All initializers
    #[must_use]
    pub fn initializers(&self) -> &BTreeMap<String, TensorPayload> {
        &self.initializers
    }

    /// Declare an input port
    pub fn push_input(&mut self, spec: PortSpec, node: NodeIndex) {
        self.inputs.push((spec, node));
    }

    /// Declare an output port
    pub fn push_output(&mut self, spec: PortSpec, node: NodeIndex) {
        self.outputs.push((spec, node));
    }

    /// Declared input ports
    #[must_use]
    pub fn inputs(&self) -> &[(PortSpec, NodeIndex)] {
        &self.inputs
    }

    /// Declared output ports
    #[must_use]
    pub fn outputs(&self) -> &[(PortSpec, NodeIndex)] {
        &self.outputs
    }

    /// Nodes referenced by any port; never eligible for removal
    #[must_use]
    pub fn port_nodes(&self) -> Vec<NodeIndex> {
        self.inputs
            .iter()
            .map(|(_, n)| *n)
            .chain(self.outputs.iter().map(|(_, n)| *n))
            .collect()
    }

    /// Full port signature, inputs then outputs; optimization must keep
    /// this identical
    #[must_use]
    pub fn port_signature(&self) -> Vec<PortSpec> {
        self.inputs
            .iter()
            .map(|(s, _)| s.clone())
            .chain(self.outputs.iter().map(|(s, _)| s.clone()))
            .collect()
    }

    /// Topological node order
    ///
    /// # Errors
    ///
    /// Returns error if the graph contains cycles.
    pub fn topo_order(&self) -> Result<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|_| PortarError::Format {
            reason: "Graph contains cycles".to_string(),
        })
    }

    /// Serialize into a [`GraphDoc`] with nodes in topological order
    ///
    /// # Errors
    ///
    /// Returns error if the graph contains cycles or a port references a
    /// missing node.
    pub fn to_doc(&self) -> Result<GraphDoc> {
        let order = self.topo_order()?;
        let mut position = BTreeMap::new();
        for (i, &ix) in order.iter().enumerate() {
            position.insert(ix, i);
        }

        let lookup = |ix: NodeIndex| -> Result<usize> {
            position.get(&ix).copied().ok_or_else(|| PortarError::Format {
                reason: "Port references a removed node".to_string(),
            })
        };

        let mut nodes = Vec::with_capacity(order.len());
        for &ix in &order {
            let op = self.graph[ix].clone();
            let mut inputs = Vec::new();
            for (src, slot) in self.node_inputs(ix) {
                if slot != inputs.len() {
                    return Err(PortarError::Format {
                        reason: format!(
                            "Node '{}' has non-contiguous input slots",
                            op.kind()
                        ),
                    });
                }
                inputs.push(lookup(src)?);
            }
            nodes.push(NodeDoc { op, inputs });
        }

        let mut inputs = Vec::with_capacity(self.inputs.len());
        for (spec, ix) in &self.inputs {
            inputs.push(GraphPort {
                spec: spec.clone(),
                node: lookup(*ix)?,
            });
        }
        let mut outputs = Vec::with_capacity(self.outputs.len());
        for (spec, ix) in &self.outputs {
            outputs.push(GraphPort {
                spec: spec.clone(),
                node: lookup(*ix)?,
            });
        }

        Ok(GraphDoc {
            nodes,
            initializers: self.initializers.clone(),
            inputs,
            outputs,
        })
    }

    /// Rebuild a graph from its serialized form
    ///
    /// # Errors
    ///
    /// Returns error if any node or port reference is out of range.
    pub fn from_doc(doc: GraphDoc) -> Result<Self> {
        let mut graph = Self::new();
        let mut indices = Vec::with_capacity(doc.nodes.len());

        for node in &doc.nodes {
            indices.push(graph.add_node(node.op.clone()));
        }
        for (i, node) in doc.nodes.iter().enumerate() {
            for (slot, &src) in node.inputs.iter().enumerate() {
                if src >= indices.len() {
                    return Err(PortarError::Format {
                        reason: format!("Node {i} references missing node {src}"),
                    });
                }
                graph.add_edge(indices[src], indices[i], slot);
            }
        }

        graph.initializers = doc.initializers;

        for port in doc.inputs {
            let ix = *indices.get(port.node).ok_or_else(|| PortarError::Format {
                reason: format!("Input port '{}' references missing node", port.spec.name),
            })?;
            graph.inputs.push((port.spec, ix));
        }
        for port in doc.outputs {
            let ix = *indices.get(port.node).ok_or_else(|| PortarError::Format {
                reason: format!("Output port '{}' references missing node", port.spec.name),
            })?;
            graph.outputs.push((port.spec, ix));
        }

        Ok(graph)
    }
}

/// One serialized node: op plus slot-ordered input node ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDoc {
    /// Operation
    pub op: Op,
    /// Producer node ids, one per input slot
    pub inputs: Vec<usize>,
}

/// Serialized graph document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDoc {
    /// Nodes in topological order
    pub nodes: Vec<NodeDoc>,
    /// Constant weights by name
    pub initializers: BTreeMap<String, TensorPayload>,
    /// Declared input ports
    pub inputs: Vec<GraphPort>,
    /// Declared output ports
    pub outputs: Vec<GraphPort>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, axes: Vec<AxisDim>) -> PortSpec {
        PortSpec {
            name: name.to_string(),
            dtype: DType::F32,
            axes,
        }
    }

    #[test]
    fn test_port_spec_validate_shape() {
        let s = spec(
            "x",
            vec![
                AxisDim::Symbolic(AXIS_BATCH.to_string()),
                AxisDim::Symbolic(AXIS_SEQ.to_string()),
                AxisDim::Fixed(8),
            ],
        );
        assert!(s.validate_shape(&[5, 13, 8]).is_ok());
        assert!(s.validate_shape(&[5, 13, 9]).is_err());
        assert!(s.validate_shape(&[5, 13]).is_err());
    }

    #[test]
    fn test_build_and_query() {
        let mut g = PortGraph::new();
        let a = g.add_node(Op::Input {
            name: "x".to_string(),
        });
        let b = g.add_node(Op::Relu);
        g.add_edge(a, b, 0);

        assert_eq!(g.node_count(), 2);
        assert_eq!(g.node_inputs(b), vec![(a, 0)]);
        assert_eq!(g.consumers(a), vec![b]);
        assert!(g.node_inputs(a).is_empty());
    }

    #[test]
    fn test_doc_roundtrip() {
        let mut g = PortGraph::new();
        let x = g.add_node(Op::Input {
            name: "x".to_string(),
        });
        let w = g.add_node(Op::Constant {
            name: "w".to_string(),
        });
        let mm = g.add_node(Op::MatMul);
        g.add_edge(x, mm, 0);
        g.add_edge(w, mm, 1);
        g.add_initializer(
            "w",
            TensorPayload::F32 {
                tensor: Tensor::from_vec(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap(),
            },
        )
        .unwrap();
        g.push_input(
            spec("x", vec![AxisDim::Symbolic(AXIS_BATCH.to_string()), AxisDim::Fixed(2)]),
            x,
        );
        g.push_output(
            spec(
                "y",
                vec![AxisDim::Symbolic(AXIS_BATCH.to_string()), AxisDim::Fixed(2)],
            ),
            mm,
        );

        let doc = g.to_doc().unwrap();
        assert_eq!(doc.nodes.len(), 3);
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: GraphDoc = serde_json::from_str(&json).unwrap();
        let rebuilt = PortGraph::from_doc(parsed).unwrap();

        assert_eq!(rebuilt.node_count(), 3);
        assert_eq!(rebuilt.port_signature(), g.port_signature());
        assert!(rebuilt.initializer("w").is_some());
    }

    #[test]
    fn test_duplicate_initializer_rejected() {
        let mut g = PortGraph::new();
        let payload = TensorPayload::F32 {
            tensor: Tensor::zeros(vec![1]).unwrap(),
        };
        g.add_initializer("w", payload.clone()).unwrap();
        assert!(g.add_initializer("w", payload).is_err());
    }

    #[test]
    fn test_q8_payload_shape() {
        let payload = TensorPayload::Q8 {
            shape: vec![4, 8],
            scales: vec![1.0],
            quants: vec![0; 32],
        };
        assert_eq!(payload.shape(), &[4, 8]);
        assert_eq!(payload.size(), 32);
    }
}
