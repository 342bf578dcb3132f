//! # Portar
//!
//! Portar (Spanish: "to port, to carry") converts a pretrained
//! sequence-to-sequence translation model into portable, statically
//! traced computation graphs, then optimizes and quantizes them for
//! deployment outside the training stack.
//!
//! The hard part is the decomposition: a stateful, dynamically shaped
//! autoregressive model becomes four independently traceable sub-graphs:
//! encoder, full decoder, incremental (cached) decoder, and output
//! projection head. Each carries a fixed calling convention, symbolic
//! axes for variable-length sequences, and a cache protocol separating
//! per-step state from compute-once state.
//!
//! ## Pipeline
//!
//! ```text
//! Extractor → Adapter → Exporter → Verifier   (per sub-graph, ×4)
//!           → Optimizer → Quantizer           (over all four artifacts)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use portar::{ConvertOptions, GraphConverter, TranslationModel};
//!
//! let model = TranslationModel::load("model.ptm".as_ref())?;
//! let mut converter = GraphConverter::new(&model, ConvertOptions::new("graphs"))?;
//! let report = converter.run()?;
//! println!("{report}");
//! ```
//!
//! ## Artifact layout
//!
//! | Role | Raw | Optimized | Quantized |
//! |------|-----|-----------|-----------|
//! | encoder | `encoder.pgf` | `encoder.opt.pgf` | `encoder.opt.quant.pgf` |
//! | decoder | `decoder.pgf` | `decoder.opt.pgf` | `decoder.opt.quant.pgf` |
//! | cached decoder | `decoder_cached.pgf` | `decoder_cached.opt.pgf` | `decoder_cached.opt.quant.pgf` |
//! | LM head | `lm_head.pgf` | `lm_head.opt.pgf` | `lm_head.opt.quant.pgf` |

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 for scale factors is fine
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::many_single_char_names)] // index math in tensor kernels
#![allow(clippy::too_many_arguments)] // attention plumbing is naturally wide

/// Decoder cache adapters with the flat tensor calling convention
pub mod adapter;
/// Flat cache schema and slot dispositions
pub mod cache;
/// Pipeline orchestration and reporting
pub mod convert;
/// Binary file envelope (magic + CRC + JSON payload)
pub mod envelope;
/// Error types
pub mod error;
/// Graph export against synthetic example inputs
pub mod export;
/// Submodule extraction from a loaded model
pub mod extract;
/// Static graphs: IR, tracing, execution, artifacts
pub mod graph;
/// Eager transformer layers (the verification reference)
pub mod layers;
/// The pretrained seq2seq model
pub mod model;
/// Shared tensor kernels
pub mod ops;
/// Graph optimization passes
pub mod optimize;
/// Symmetric Q8 weight quantization
pub mod quantize;
/// Tensor type
pub mod tensor;
/// Eager-vs-graph verification
pub mod verify;

pub use convert::{ConversionReport, ConvertOptions, GraphConverter, RoleReport, StageStatus};
pub use error::{PortarError, Result};
pub use graph::{ArtifactStore, ExportArtifact, Role, Stage};
pub use model::{ModelConfig, TranslationModel};
pub use tensor::Tensor;
