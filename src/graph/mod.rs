//! Static computation graphs: representation, tracing, execution, artifacts
//!
//! The pipeline's central abstraction. A submodule is traced into a
//! [`PortGraph`] ([`trace`]), serialized as a role/stage-identified
//! artifact file ([`artifact`]), and re-executed for verification and
//! downstream consumption ([`exec`]).

mod artifact;
mod exec;
mod ir;
mod trace;

pub use artifact::{ArtifactStore, ExportArtifact, Role, Stage, ARTIFACT_MAGIC};
pub(crate) use exec::eval_pure;
pub use exec::{GraphExecutor, TensorValue};
pub use ir::{
    AxisDim, DType, GraphDoc, GraphPort, NodeDoc, Op, PortGraph, PortSpec, TensorPayload,
    AXIS_BATCH, AXIS_SEQ,
};
pub use trace::{TraceId, Tracer};
