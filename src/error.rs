//! Error types for the conversion pipeline
//!
//! The pipeline distinguishes fatal failure classes (unsupported source
//! architecture, trace capture failure, verification mismatch) from
//! per-artifact best-effort classes (optimization, quantization). Fatal
//! errors stop the whole pipeline because every later stage depends on a
//! correct base artifact; best-effort errors are isolated per role.

use thiserror::Error;

use crate::graph::Role;

/// Result type alias for portar operations
pub type Result<T> = std::result::Result<T, PortarError>;

/// Error type for all conversion operations
#[derive(Debug, Error)]
pub enum PortarError {
    /// Tensor shape is invalid for the requested operation
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Human-readable description of the violation
        reason: String,
    },

    /// Data buffer does not match the declared shape
    #[error("Data size {data_size} doesn't match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual number of elements in the buffer
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Number of elements the shape implies
        expected: usize,
    },

    /// Source model does not expose the expected encoder/decoder/projection
    /// substructure. Raised before any export work begins.
    #[error("Unsupported architecture: {reason}")]
    UnsupportedArchitecture {
        /// What was missing or malformed
        reason: String,
    },

    /// The tracer could not capture a deterministic static graph from a
    /// submodule. Fatal for that role.
    #[error("Trace export failed for {role}: {reason}")]
    TraceExport {
        /// Which sub-graph was being traced
        role: Role,
        /// Why the capture failed
        reason: String,
    },

    /// Exported graph output diverged from the eager output beyond tolerance.
    /// Fatal for that role; the pipeline halts rather than shipping a
    /// silently-incorrect artifact.
    #[error(
        "Verification mismatch for {role} at element {index}: \
         graph={got} eager={want} (|diff|={diff}, rtol={rtol}, atol={atol})"
    )]
    VerificationMismatch {
        /// Which sub-graph failed verification
        role: Role,
        /// Flat index of the first offending element
        index: usize,
        /// Value produced by graph execution
        got: f32,
        /// Value produced by the eager reference
        want: f32,
        /// Absolute difference
        diff: f32,
        /// Relative tolerance in effect
        rtol: f32,
        /// Absolute tolerance in effect
        atol: f32,
    },

    /// A graph optimization pass failed. Non-fatal: the caller falls back to
    /// the unoptimized artifact with a logged warning.
    #[error("Optimization failed for {role}: {reason}")]
    Optimization {
        /// Which artifact was being optimized
        role: Role,
        /// Pass name and cause
        reason: String,
    },

    /// Quantization of one artifact failed. Non-fatal for the other roles.
    #[error("Quantization failed for {role}: {reason}")]
    Quantization {
        /// Which artifact was being quantized
        role: Role,
        /// Cause
        reason: String,
    },

    /// Malformed model or artifact file
    #[error("Format error: {reason}")]
    Format {
        /// Description of the corruption or mismatch
        reason: String,
    },

    /// Graph execution failed (missing input, unknown port, cycle)
    #[error("Execution error: {reason}")]
    Execution {
        /// Description of the failure
        reason: String,
    },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_shape() {
        let err = PortarError::InvalidShape {
            reason: "shape cannot be empty".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid shape: shape cannot be empty");
    }

    #[test]
    fn test_error_display_verification_mismatch_names_role_and_index() {
        let err = PortarError::VerificationMismatch {
            role: Role::DecoderCached,
            index: 7,
            got: 1.5,
            want: 1.0,
            diff: 0.5,
            rtol: 1e-3,
            atol: 1e-5,
        };
        let msg = err.to_string();
        assert!(msg.contains("decoder_cached"));
        assert!(msg.contains("element 7"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PortarError = io.into();
        assert!(matches!(err, PortarError::Io(_)));
    }
}
