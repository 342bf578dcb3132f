//! Export verification
//!
//! Re-executes each written artifact on the exact example inputs it was
//! traced with and asserts elementwise agreement with the eager output.
//! A mismatch means miscaptured control flow or a wrong axis binding, so
//! it is fatal for that role; the pipeline halts rather than shipping a
//! silently-incorrect artifact.
//!
//! The tolerance applies to the raw and optimized stages only; quantized
//! artifacts are expected to diverge from the float reference.

use tracing::info;

use crate::error::{PortarError, Result};
use crate::export::ExportOutcome;
use crate::graph::{ArtifactStore, GraphExecutor, Role};
use crate::tensor::Tensor;

/// Default relative tolerance
pub const RTOL: f32 = 1e-3;

/// Default absolute tolerance
pub const ATOL: f32 = 1e-5;

/// Compares eager and graph-executed outputs within tolerance
#[derive(Debug, Clone, Copy)]
pub struct ExportVerifier {
    rtol: f32,
    atol: f32,
}

impl Default for ExportVerifier {
    fn default() -> Self {
        Self {
            rtol: RTOL,
            atol: ATOL,
        }
    }
}

impl ExportVerifier {
    /// Create a verifier with custom tolerances
    #[must_use]
    pub fn new(rtol: f32, atol: f32) -> Self {
        Self { rtol, atol }
    }

    /// Verify one export outcome against its written artifact
    ///
    /// Loads the artifact back from disk (covering serialization as well
    /// as execution), runs it on the recorded example inputs, and checks
    /// the primary `output` tensor.
    ///
    /// # Errors
    ///
    /// Returns [`PortarError::VerificationMismatch`] on divergence, or an
    /// execution/format error if the artifact cannot be replayed.
    pub fn verify(&self, outcome: &ExportOutcome) -> Result<()> {
        let role = outcome.artifact.role;
        let graph = ArtifactStore::load_path(&outcome.artifact.path)?;
        let outputs = GraphExecutor::new(&graph).run(&outcome.example_inputs)?;
        let got = outputs
            .get("output")
            .ok_or_else(|| PortarError::Execution {
                reason: format!("Artifact for {role} has no 'output' port"),
            })?
            .as_f32()?;

        self.assert_allclose(role, got, &outcome.eager_output)?;
        info!(role = %role, elements = got.size(), "verified against eager output");
        Ok(())
    }

    /// Elementwise `|a - b| <= atol + rtol * |b|` check
    ///
    /// # Errors
    ///
    /// Returns [`PortarError::VerificationMismatch`] naming the first
    /// offending element.
    pub fn assert_allclose(
        &self,
        role: Role,
        actual: &Tensor<f32>,
        expected: &Tensor<f32>,
    ) -> Result<()> {
        if actual.shape() != expected.shape() {
            return Err(PortarError::Execution {
                reason: format!(
                    "Output shape mismatch for {role}: graph {:?} vs eager {:?}",
                    actual.shape(),
                    expected.shape()
                ),
            });
        }

        for (index, (&got, &want)) in actual.data().iter().zip(expected.data().iter()).enumerate()
        {
            let diff = (got - want).abs();
            let bound = self.atol + self.rtol * want.abs();
            if !diff.is_finite() || diff > bound {
                return Err(PortarError::VerificationMismatch {
                    role,
                    index,
                    got,
                    want,
                    diff,
                    rtol: self.rtol,
                    atol: self.atol,
                });
            }
        }
        Ok(())
    }
}
