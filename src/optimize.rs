//! Graph optimization
//!
//! Structural, semantics-preserving rewrites over raw artifacts:
//! constant folding, MatMul+Add fusion into Gemm, and dead-node pruning.
//! Passes compose and run until fixpoint. Two hard rules:
//!
//! - The port signature (names, order, dtypes, axis bindings) must come
//!   out identical, because downstream consumers bind by name. Every
//!   pass run is followed by a signature check.
//! - Optimization is best-effort: the caller falls back to the raw
//!   artifact with a warning instead of aborting the pipeline.

use tracing::{debug, info, warn};

use crate::error::{PortarError, Result};
use crate::graph::{eval_pure, Op, PortGraph, Role, TensorPayload};
use crate::tensor::Tensor;

/// One rewrite over a graph
pub trait OptimizationPass {
    /// Pass name for diagnostics
    fn name(&self) -> &'static str;

    /// Apply the pass; returns whether anything changed
    ///
    /// # Errors
    ///
    /// Returns error if the graph is malformed for this rewrite.
    fn run(&self, graph: &mut PortGraph) -> Result<bool>;
}

/// Evaluate nodes whose operands are all constants and replace them with
/// folded constants
///
/// The prime customer is the weight transpose every traced linear emits:
/// `Transpose(W)` collapses into a pre-transposed initializer, which is
/// also what later makes the MatMul+Add fusion a plain `[in, out]` Gemm.
pub struct FoldConstants;

impl OptimizationPass for FoldConstants {
    fn name(&self) -> &'static str {
        "FoldConstants"
    }

    fn run(&self, graph: &mut PortGraph) -> Result<bool> {
        let mut changed = false;
        let mut fold_counter = 0usize;

        for ix in graph.node_indices() {
            let op = match graph.node(ix) {
                Some(op) => op.clone(),
                None => continue,
            };
            if matches!(
                op,
                Op::Input { .. } | Op::Constant { .. } | Op::Gather | Op::QGemm
            ) {
                continue;
            }

            let inputs = graph.node_inputs(ix);
            if inputs.is_empty() {
                continue;
            }

            let mut operands: Vec<Tensor<f32>> = Vec::with_capacity(inputs.len());
            let mut all_const = true;
            for (src, _) in &inputs {
                match graph.node(*src) {
                    Some(Op::Constant { name }) => match graph.initializer(name) {
                        Some(TensorPayload::F32 { tensor }) => operands.push(tensor.clone()),
                        _ => {
                            all_const = false;
                            break;
                        }
                    },
                    _ => {
                        all_const = false;
                        break;
                    }
                }
            }
            if !all_const {
                continue;
            }

            let operand_refs: Vec<&Tensor<f32>> = operands.iter().collect();
            let folded = eval_pure(&op, &operand_refs)?;

            let name = loop {
                let candidate = format!("folded.{fold_counter}");
                fold_counter += 1;
                if graph.initializer(&candidate).is_none() {
                    break candidate;
                }
            };
            graph.set_initializer(&name, TensorPayload::F32 { tensor: folded });
            graph.clear_node_inputs(ix);
            if let Some(node) = graph.node_mut(ix) {
                *node = Op::Constant { name };
            }
            changed = true;
        }

        Ok(changed)
    }
}

/// Fuse `MatMul(x, W) + Add(bias)` into a single `Gemm` node
///
/// Requires the weight and bias to be constants and the MatMul to have no
/// other consumer. The Add node becomes the Gemm (keeping its index, and
/// with it any output-port binding); the MatMul node is removed.
pub struct FuseMatMulAdd;

impl OptimizationPass for FuseMatMulAdd {
    fn name(&self) -> &'static str {
        "FuseMatMulAdd"
    }

    fn run(&self, graph: &mut PortGraph) -> Result<bool> {
        let mut changed = false;
        let port_nodes = graph.port_nodes();

        for add_ix in graph.node_indices() {
            if !matches!(graph.node(add_ix), Some(Op::Add)) {
                continue;
            }
            let add_inputs = graph.node_inputs(add_ix);
            if add_inputs.len() != 2 {
                continue;
            }
            let (mm_ix, bias_ix) = (add_inputs[0].0, add_inputs[1].0);

            if !matches!(graph.node(mm_ix), Some(Op::MatMul)) {
                continue;
            }
            // the MatMul result must not be observable elsewhere
            if graph.consumers(mm_ix).len() != 1 || port_nodes.contains(&mm_ix) {
                continue;
            }

            let bias_is_vector = match graph.node(bias_ix) {
                Some(Op::Constant { name }) => matches!(
                    graph.initializer(name),
                    Some(TensorPayload::F32 { tensor }) if tensor.ndim() == 1
                ),
                _ => false,
            };
            if !bias_is_vector {
                continue;
            }

            let mm_inputs = graph.node_inputs(mm_ix);
            if mm_inputs.len() != 2 {
                continue;
            }
            let (x_ix, w_ix) = (mm_inputs[0].0, mm_inputs[1].0);
            let weight_is_matrix = match graph.node(w_ix) {
                Some(Op::Constant { name }) => matches!(
                    graph.initializer(name),
                    Some(TensorPayload::F32 { tensor }) if tensor.ndim() == 2
                ),
                _ => false,
            };
            if !weight_is_matrix {
                continue;
            }

            graph.clear_node_inputs(add_ix);
            if let Some(node) = graph.node_mut(add_ix) {
                *node = Op::Gemm;
            }
            graph.add_edge(x_ix, add_ix, 0);
            graph.add_edge(w_ix, add_ix, 1);
            graph.add_edge(bias_ix, add_ix, 2);
            graph.remove_node(mm_ix);
            changed = true;
        }

        Ok(changed)
    }
}

/// Remove nodes unreachable from any port, and initializers no remaining
/// constant references
pub struct PruneDeadNodes;

impl OptimizationPass for PruneDeadNodes {
    fn name(&self) -> &'static str {
        "PruneDeadNodes"
    }

    fn run(&self, graph: &mut PortGraph) -> Result<bool> {
        let mut live: Vec<_> = graph.port_nodes();
        let mut worklist = live.clone();
        while let Some(ix) = worklist.pop() {
            for (src, _) in graph.node_inputs(ix) {
                if !live.contains(&src) {
                    live.push(src);
                    worklist.push(src);
                }
            }
        }

        let mut changed = false;
        for ix in graph.node_indices() {
            if !live.contains(&ix) {
                graph.remove_node(ix);
                changed = true;
            }
        }

        let referenced: Vec<String> = graph
            .node_indices()
            .into_iter()
            .filter_map(|ix| match graph.node(ix) {
                Some(Op::Constant { name }) => Some(name.clone()),
                _ => None,
            })
            .collect();
        let orphaned: Vec<String> = graph
            .initializers()
            .keys()
            .filter(|name| !referenced.contains(name))
            .cloned()
            .collect();
        for name in orphaned {
            graph.remove_initializer(&name);
            changed = true;
        }

        Ok(changed)
    }
}

/// The default pass list, in application order
#[must_use]
pub fn default_passes() -> Vec<Box<dyn OptimizationPass>> {
    vec![
        Box::new(FoldConstants),
        Box::new(FuseMatMulAdd),
        Box::new(PruneDeadNodes),
    ]
}

/// Optimizer policy
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Fixpoint iteration cap
    pub max_iterations: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iterations: 10 }
    }
}

/// Applies optimization passes to one artifact's graph
pub struct GraphOptimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
    max_iterations: usize,
}

impl GraphOptimizer {
    /// Optimizer with the default pass list
    #[must_use]
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            passes: default_passes(),
            max_iterations: config.max_iterations,
        }
    }

    /// Optimizer with a custom pass list (also the fault-injection seam
    /// for stage-isolation tests)
    #[must_use]
    pub fn with_passes(passes: Vec<Box<dyn OptimizationPass>>, max_iterations: usize) -> Self {
        Self {
            passes,
            max_iterations,
        }
    }

    /// Produce an optimized copy of a graph
    ///
    /// Runs all passes in sequence until fixpoint or the iteration cap.
    /// The input graph is untouched; the result has an identical port
    /// signature or this returns an error.
    ///
    /// # Errors
    ///
    /// Returns [`PortarError::Optimization`] if any pass fails or alters
    /// the port signature. The caller is expected to fall back to the
    /// unoptimized graph.
    pub fn optimize(&self, role: Role, graph: &PortGraph) -> Result<PortGraph> {
        let mut optimized = graph.clone();
        let signature = graph.port_signature();
        let initial_nodes = optimized.node_count();

        for iteration in 0..self.max_iterations {
            let mut iteration_changed = false;
            for pass in &self.passes {
                let changed =
                    pass.run(&mut optimized)
                        .map_err(|e| PortarError::Optimization {
                            role,
                            reason: format!("{}: {e}", pass.name()),
                        })?;
                if optimized.port_signature() != signature {
                    return Err(PortarError::Optimization {
                        role,
                        reason: format!("{} altered the port signature", pass.name()),
                    });
                }
                if changed {
                    iteration_changed = true;
                    debug!(role = %role, pass = pass.name(), iteration, "pass changed graph");
                }
            }
            if !iteration_changed {
                break;
            }
            if iteration + 1 == self.max_iterations {
                warn!(role = %role, "optimization stopped at iteration cap");
            }
        }

        info!(
            role = %role,
            nodes_before = initial_nodes,
            nodes_after = optimized.node_count(),
            "optimized"
        );
        Ok(optimized)
    }
}
