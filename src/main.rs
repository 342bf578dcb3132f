//! Portar CLI - seq2seq model to portable graph converter
//!
//! # Commands
//!
//! - `convert` - Convert a model file into raw, optimized, and quantized graphs
//! - `inspect` - Show an artifact's ports and node statistics
//! - `init` - Write a randomly initialized demo model file

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use portar::graph::{ArtifactStore, AxisDim, PortSpec};
use portar::layers::Activation;
use portar::model::SUPPORTED_ARCHITECTURE;
use portar::{ConvertOptions, GraphConverter, ModelConfig, TranslationModel};

/// Portar - convert translation models into portable computation graphs
///
/// Exports encoder, decoder, cached decoder, and LM head as separate
/// artifacts with symbolic batch/sequence axes, then optimizes and
/// quantizes each one.
#[derive(Parser)]
#[command(name = "portar")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full conversion pipeline on a model file
    ///
    /// Examples:
    ///   portar convert model.ptm --out graphs/
    ///   portar convert model.ptm --out graphs/ --batch-size 4 --max-length 16
    Convert {
        /// Model file (.ptm)
        #[arg(value_name = "MODEL")]
        model: PathBuf,

        /// Output directory for artifacts
        #[arg(short, long, default_value = "graphs")]
        out: PathBuf,

        /// Example-input batch size
        #[arg(short, long, default_value = "4")]
        batch_size: usize,

        /// Example-input sequence length
        #[arg(short, long, default_value = "16")]
        max_length: usize,

        /// Seed for synthetic example inputs
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Stop after export + verification (skip optimize and quantize)
        #[arg(long)]
        raw_only: bool,
    },
    /// Show an artifact's ports and node statistics
    ///
    /// Examples:
    ///   portar inspect graphs/decoder_cached.pgf
    Inspect {
        /// Artifact file (.pgf)
        #[arg(value_name = "ARTIFACT")]
        artifact: PathBuf,
    },
    /// Write a randomly initialized demo model file
    ///
    /// Examples:
    ///   portar init demo.ptm --d-model 64 --layers 2 --heads 4
    Init {
        /// Output model file (.ptm)
        #[arg(value_name = "MODEL")]
        model: PathBuf,

        /// Embedding dimension
        #[arg(long, default_value = "64")]
        d_model: usize,

        /// Encoder/decoder layer count
        #[arg(long, default_value = "2")]
        layers: usize,

        /// Attention head count
        #[arg(long, default_value = "4")]
        heads: usize,

        /// Vocabulary size
        #[arg(long, default_value = "1000")]
        vocab: usize,

        /// Weight initialization seed
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn axis_label(axis: &AxisDim) -> String {
    match axis {
        AxisDim::Fixed(n) => n.to_string(),
        AxisDim::Symbolic(name) => name.clone(),
    }
}

fn port_line(spec: &PortSpec) -> String {
    let axes: Vec<String> = spec.axes.iter().map(axis_label).collect();
    format!("  {:<28} {:?} [{}]", spec.name, spec.dtype, axes.join(", "))
}

fn run() -> portar::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            model,
            out,
            batch_size,
            max_length,
            seed,
            raw_only,
        } => {
            let model = TranslationModel::load(&model)?;
            let options = ConvertOptions {
                batch_size,
                max_length,
                seed,
                ..ConvertOptions::new(out)
            };
            let mut converter = GraphConverter::new(&model, options)?;
            if raw_only {
                converter.convert_to_graphs()?;
            } else {
                converter.run()?;
            }
            print!("{}", converter.report());
        }
        Commands::Inspect { artifact } => {
            let graph = ArtifactStore::load_path(&artifact)?;
            println!("Artifact: {}", artifact.display());
            println!(
                "Nodes: {}  Edges: {}  Initializers: {}",
                graph.node_count(),
                graph.edge_count(),
                graph.initializers().len()
            );
            println!("Inputs:");
            for (spec, _) in graph.inputs() {
                println!("{}", port_line(spec));
            }
            println!("Outputs:");
            for (spec, _) in graph.outputs() {
                println!("{}", port_line(spec));
            }
        }
        Commands::Init {
            model,
            d_model,
            layers,
            heads,
            vocab,
            seed,
        } => {
            let config = ModelConfig {
                architecture: SUPPORTED_ARCHITECTURE.to_string(),
                d_model,
                num_layers: layers,
                num_heads: heads,
                vocab_size: vocab,
                ffn_dim: d_model * 4,
                max_positions: 512,
                activation: Activation::Gelu,
                eps: 1e-5,
            };
            let demo = TranslationModel::random(config, seed)?;
            demo.save(&model)?;
            println!("Wrote demo model to {}", model.display());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let filter = EnvFilter::from_default_env()
        .add_directive("portar=info".parse().expect("valid directive"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
