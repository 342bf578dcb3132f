//! Export artifacts and the artifact store
//!
//! An artifact is one serialized graph identified by a logical role (which
//! sub-graph) and a pipeline stage (how far it has progressed). Artifacts
//! are never mutated in place: each stage writes a new file, and later
//! stages read earlier ones read-only.
//!
//! ## Directory layout
//!
//! ```text
//! <dir>/encoder.pgf            encoder.opt.pgf            encoder.opt.quant.pgf
//! <dir>/decoder.pgf            decoder.opt.pgf            decoder.opt.quant.pgf
//! <dir>/decoder_cached.pgf     decoder_cached.opt.pgf     decoder_cached.opt.quant.pgf
//! <dir>/lm_head.pgf            lm_head.opt.pgf            lm_head.opt.quant.pgf
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::envelope;
use crate::error::{PortarError, Result};

use super::ir::{GraphDoc, PortGraph};

/// Magic bytes for graph artifact files
pub const ARTIFACT_MAGIC: [u8; 4] = *b"PGF\0";

/// Logical role of an exported sub-graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Source-side encoder
    Encoder,
    /// Full decoder (first decoding step, no cache input)
    Decoder,
    /// Incremental decoder (consumes and re-emits the cache)
    DecoderCached,
    /// Output projection head
    LmHead,
}

impl Role {
    /// All roles in pipeline order
    pub const ALL: [Role; 4] = [Role::Encoder, Role::Decoder, Role::DecoderCached, Role::LmHead];

    /// Stable identifier used in file names and reports
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Encoder => "encoder",
            Role::Decoder => "decoder",
            Role::DecoderCached => "decoder_cached",
            Role::LmHead => "lm_head",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// As traced
    Raw,
    /// After graph optimization
    Optimized,
    /// After weight quantization
    Quantized,
}

impl Stage {
    /// File-name suffix between role and extension
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Stage::Raw => "",
            Stage::Optimized => ".opt",
            Stage::Quantized => ".opt.quant",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Raw => f.write_str("raw"),
            Stage::Optimized => f.write_str("optimized"),
            Stage::Quantized => f.write_str("quantized"),
        }
    }
}

/// A written artifact: role, stage, and file identity
#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    /// Which sub-graph
    pub role: Role,
    /// How far through the pipeline
    pub stage: Stage,
    /// File the graph was written to
    pub path: PathBuf,
}

/// Append-only directory of artifact files
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) an artifact directory
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// The store directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a role and stage
    #[must_use]
    pub fn path(&self, role: Role, stage: Stage) -> PathBuf {
        self.dir
            .join(format!("{}{}.pgf", role.as_str(), stage.suffix()))
    }

    /// Whether an artifact file exists
    #[must_use]
    pub fn exists(&self, role: Role, stage: Stage) -> bool {
        self.path(role, stage).is_file()
    }

    /// Serialize a graph as an artifact file
    ///
    /// # Errors
    ///
    /// Returns error on serialization or I/O failure.
    pub fn write(&self, role: Role, stage: Stage, graph: &PortGraph) -> Result<ExportArtifact> {
        let doc = graph.to_doc()?;
        let payload = serde_json::to_vec(&doc).map_err(|e| PortarError::Format {
            reason: format!("Failed to serialize graph: {e}"),
        })?;
        let path = self.path(role, stage);
        fs::write(&path, envelope::write_envelope(ARTIFACT_MAGIC, &payload))?;
        debug!(role = %role, stage = %stage, path = %path.display(), "wrote artifact");
        Ok(ExportArtifact { role, stage, path })
    }

    /// Load an artifact back into a graph
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing, corrupt, or malformed.
    pub fn load(&self, role: Role, stage: Stage) -> Result<PortGraph> {
        Self::load_path(&self.path(role, stage))
    }

    /// Load a graph from an arbitrary artifact path
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing, corrupt, or malformed.
    pub fn load_path(path: &Path) -> Result<PortGraph> {
        let bytes = fs::read(path)?;
        let payload = envelope::read_envelope(ARTIFACT_MAGIC, &bytes)?;
        let doc: GraphDoc = serde_json::from_slice(payload).map_err(|e| PortarError::Format {
            reason: format!("Failed to parse graph payload: {e}"),
        })?;
        PortGraph::from_doc(doc)
    }
}
