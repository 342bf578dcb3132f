//! Conversion pipeline
//!
//! Orchestrates the full Extractor → Adapter → Exporter → Verifier →
//! Optimizer → Quantizer flow over the four sub-graphs. Strictly
//! sequential and run-to-completion:
//!
//! - Extraction and per-role export/verification are **fail-fast**: a
//!   trace failure or verification mismatch stops the pipeline, since
//!   every later stage depends on a correct base artifact.
//! - Optimization is **best-effort**: a failing role falls back to its
//!   raw graph with a warning.
//! - Quantization is **isolated per role**: one role failing never
//!   blocks the other three.
//!
//! Every role/stage outcome lands in the [`ConversionReport`].

use std::fmt;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::Result;
use crate::export::GraphExporter;
use crate::extract::{SubgraphExtractor, Subgraphs};
use crate::graph::{ArtifactStore, Role, Stage};
use crate::model::TranslationModel;
use crate::optimize::{GraphOptimizer, OptimizerConfig};
use crate::quantize::{GraphQuantizer, QuantizerConfig};
use crate::verify::ExportVerifier;

/// Pipeline configuration
///
/// `batch_size` and `max_length` size the example inputs only; exported
/// graphs stay dynamically shaped along batch and sequence axes.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Example-input batch size
    pub batch_size: usize,
    /// Example-input sequence length
    pub max_length: usize,
    /// Directory artifacts are written into
    pub artifact_dir: PathBuf,
    /// Seed for the synthetic example inputs
    pub seed: u64,
    /// Optimizer policy
    pub optimizer: OptimizerConfig,
    /// Quantizer policy
    pub quantizer: QuantizerConfig,
}

impl ConvertOptions {
    /// Defaults with a given artifact directory
    #[must_use]
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            batch_size: 4,
            max_length: 16,
            artifact_dir: artifact_dir.into(),
            seed: 0,
            optimizer: OptimizerConfig::default(),
            quantizer: QuantizerConfig::default(),
        }
    }
}

/// Outcome of one stage for one role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// Stage completed
    Ok,
    /// Stage failed but the raw graph was carried forward
    FellBack {
        /// The logged warning
        warning: String,
    },
    /// Stage failed and produced nothing
    Failed {
        /// The error
        error: String,
    },
    /// Stage never ran (earlier failure or not requested)
    Skipped,
}

impl StageStatus {
    /// Whether an artifact exists for this stage
    #[must_use]
    pub fn produced_artifact(&self) -> bool {
        matches!(self, StageStatus::Ok | StageStatus::FellBack { .. })
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Ok => f.write_str("ok"),
            StageStatus::FellBack { .. } => f.write_str("fell-back"),
            StageStatus::Failed { .. } => f.write_str("FAILED"),
            StageStatus::Skipped => f.write_str("skipped"),
        }
    }
}

/// Per-role stage outcomes
#[derive(Debug, Clone)]
pub struct RoleReport {
    /// Which sub-graph
    pub role: Role,
    /// Trace + export + verify outcome
    pub raw: StageStatus,
    /// Optimization outcome
    pub optimized: StageStatus,
    /// Quantization outcome
    pub quantized: StageStatus,
}

/// Success/failure report for the whole pipeline
#[derive(Debug, Clone)]
pub struct ConversionReport {
    /// One entry per role, in pipeline order
    pub roles: Vec<RoleReport>,
}

impl ConversionReport {
    fn new() -> Self {
        Self {
            roles: Role::ALL
                .iter()
                .map(|&role| RoleReport {
                    role,
                    raw: StageStatus::Skipped,
                    optimized: StageStatus::Skipped,
                    quantized: StageStatus::Skipped,
                })
                .collect(),
        }
    }

    /// Entry for one role
    ///
    /// # Panics
    ///
    /// Never; every role is present by construction.
    #[must_use]
    pub fn role(&self, role: Role) -> &RoleReport {
        self.roles
            .iter()
            .find(|r| r.role == role)
            .expect("report holds every role")
    }

    fn role_mut(&mut self, role: Role) -> &mut RoleReport {
        self.roles
            .iter_mut()
            .find(|r| r.role == role)
            .expect("report holds every role")
    }

    /// Whether every role passed raw export + verification
    #[must_use]
    pub fn all_verified(&self) -> bool {
        self.roles.iter().all(|r| r.raw == StageStatus::Ok)
    }
}

impl fmt::Display for ConversionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Conversion report:")?;
        for r in &self.roles {
            writeln!(
                f,
                "  {:<15} raw={:<9} optimized={:<9} quantized={}",
                r.role.to_string(),
                r.raw.to_string(),
                r.optimized.to_string(),
                r.quantized
            )?;
        }
        Ok(())
    }
}

/// The conversion pipeline over one loaded model
pub struct GraphConverter {
    subgraphs: Subgraphs,
    d_model: usize,
    store: ArtifactStore,
    options: ConvertOptions,
    report: ConversionReport,
}

impl GraphConverter {
    /// Extract submodules and open the artifact store
    ///
    /// # Errors
    ///
    /// Returns [`crate::PortarError::UnsupportedArchitecture`] before any
    /// export work if the model doesn't expose the expected structure.
    pub fn new(model: &TranslationModel, options: ConvertOptions) -> Result<Self> {
        let subgraphs = SubgraphExtractor::extract(model)?;
        let store = ArtifactStore::new(&options.artifact_dir)?;
        Ok(Self {
            subgraphs,
            d_model: model.config().d_model,
            store,
            options,
            report: ConversionReport::new(),
        })
    }

    /// The artifact store
    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Current report
    #[must_use]
    pub fn report(&self) -> &ConversionReport {
        &self.report
    }

    /// Trace, export, and verify all four sub-graphs (fail-fast)
    ///
    /// # Errors
    ///
    /// Returns the first trace or verification error; the report records
    /// which role and stage failed.
    pub fn convert_to_graphs(&mut self) -> Result<()> {
        let exporter = GraphExporter::new(
            self.options.batch_size,
            self.options.max_length,
            self.options.seed,
        )?;
        let verifier = ExportVerifier::default();

        for role in Role::ALL {
            let exported = match role {
                Role::Encoder => exporter.export_encoder(&self.subgraphs.encoder, &self.store),
                Role::Decoder => exporter.export_decoder(&self.subgraphs.decoder, &self.store),
                Role::DecoderCached => exporter
                    .export_decoder_cached(&self.subgraphs.decoder_cached, &self.store),
                Role::LmHead => {
                    exporter.export_lm_head(&self.subgraphs.lm_head, &self.store, self.d_model)
                }
            };
            let outcome = match exported {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.report.role_mut(role).raw = StageStatus::Failed {
                        error: e.to_string(),
                    };
                    return Err(e);
                }
            };
            if let Err(e) = verifier.verify(&outcome) {
                self.report.role_mut(role).raw = StageStatus::Failed {
                    error: e.to_string(),
                };
                return Err(e);
            }
            self.report.role_mut(role).raw = StageStatus::Ok;
        }
        info!("all sub-graphs exported and verified");
        Ok(())
    }

    /// Optimize all four artifacts (best-effort per role)
    ///
    /// # Errors
    ///
    /// Returns error only on I/O failure; optimization failures degrade
    /// to the raw artifact with a warning.
    pub fn optimize_graphs(&mut self) -> Result<()> {
        let config = self.options.optimizer.clone();
        self.optimize_graphs_with(|_| GraphOptimizer::new(&config))
    }

    /// Optimize with a per-role optimizer factory
    ///
    /// The seam for custom pass lists and for injecting failures in
    /// stage-isolation tests.
    ///
    /// # Errors
    ///
    /// Returns error only on I/O failure.
    pub fn optimize_graphs_with<F>(&mut self, factory: F) -> Result<()>
    where
        F: Fn(Role) -> GraphOptimizer,
    {
        for role in Role::ALL {
            if self.report.role(role).raw != StageStatus::Ok {
                continue;
            }
            let raw = self.store.load(role, Stage::Raw)?;
            match factory(role).optimize(role, &raw) {
                Ok(optimized) => {
                    self.store.write(role, Stage::Optimized, &optimized)?;
                    self.report.role_mut(role).optimized = StageStatus::Ok;
                }
                Err(e) => {
                    // best-effort stage: carry the raw graph forward
                    warn!(role = %role, error = %e, "optimization failed, using raw graph");
                    self.store.write(role, Stage::Optimized, &raw)?;
                    self.report.role_mut(role).optimized = StageStatus::FellBack {
                        warning: e.to_string(),
                    };
                }
            }
        }
        Ok(())
    }

    /// Quantize all four optimized artifacts (isolated per role)
    ///
    /// # Errors
    ///
    /// Returns error only on I/O failure; a role's quantization failure
    /// is recorded and the remaining roles proceed.
    pub fn quantize_graphs(&mut self) -> Result<()> {
        let quantizer = GraphQuantizer::new(self.options.quantizer.clone());
        for role in Role::ALL {
            if !self.report.role(role).optimized.produced_artifact() {
                continue;
            }
            let optimized = self.store.load(role, Stage::Optimized)?;
            match quantizer.quantize(role, &optimized) {
                Ok(quantized) => {
                    self.store.write(role, Stage::Quantized, &quantized)?;
                    self.report.role_mut(role).quantized = StageStatus::Ok;
                }
                Err(e) => {
                    warn!(role = %role, error = %e, "quantization failed for this role");
                    self.report.role_mut(role).quantized = StageStatus::Failed {
                        error: e.to_string(),
                    };
                }
            }
        }
        Ok(())
    }

    /// Run the whole pipeline: export + verify, optimize, quantize
    ///
    /// # Errors
    ///
    /// Returns the first fatal error (unsupported architecture was
    /// already rejected in [`GraphConverter::new`]; here: trace capture,
    /// verification mismatch, or I/O).
    pub fn run(&mut self) -> Result<&ConversionReport> {
        self.convert_to_graphs()?;
        self.optimize_graphs()?;
        self.quantize_graphs()?;
        Ok(&self.report)
    }
}
