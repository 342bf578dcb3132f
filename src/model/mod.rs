//! Pretrained seq2seq translation model
//!
//! The conversion pipeline's input: an encoder-decoder transformer with
//! attention caching, loaded from a checked binary file. The model owns
//! its weights; submodules extracted from it hold non-owning views (`Arc`
//! clones of immutable weight stores) for the duration of export.
//!
//! ## File format
//!
//! Magic `PTM\0` followed by the standard envelope (see [`crate::envelope`])
//! around a JSON payload of config and weights.
//!
//! ## Architecture
//!
//! Post-layer-norm transformer:
//!
//! ```text
//! embed(ids) * sqrt(d_model) + sinusoidal(pos)
//! encoder layer:  x = LN(x + SelfAttn(x, pad_mask)); x = LN(x + FFN(x))
//! decoder layer:  x = LN(x + CausalSelfAttn(x));
//!                 x = LN(x + CrossAttn(x, enc_out, enc_mask));
//!                 x = LN(x + FFN(x))
//! logits = hidden @ lm_head.T + final_logits_bias
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheState, LayerCache};
use crate::envelope;
use crate::error::{PortarError, Result};
use crate::layers::{
    sinusoidal_table, Activation, Embedding, FeedForward, LayerNorm, Linear, MultiHeadAttention,
};
use crate::ops;
use crate::tensor::Tensor;

/// Magic bytes for model files
pub const MODEL_MAGIC: [u8; 4] = *b"PTM\0";

/// Architecture tag this pipeline supports
pub const SUPPORTED_ARCHITECTURE: &str = "seq2seq-transformer";

/// Model hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture tag; extraction requires [`SUPPORTED_ARCHITECTURE`]
    pub architecture: String,
    /// Embedding dimension
    pub d_model: usize,
    /// Number of encoder and decoder layers
    pub num_layers: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Vocabulary size (shared source/target)
    pub vocab_size: usize,
    /// Feed-forward inner dimension
    pub ffn_dim: usize,
    /// Maximum sequence length the position table covers
    pub max_positions: usize,
    /// Feed-forward activation
    pub activation: Activation,
    /// Layer norm epsilon
    pub eps: f32,
}

impl ModelConfig {
    /// Per-head dimension `d_k = d_model / num_heads`
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.d_model / self.num_heads
    }

    /// Embedding scale factor `sqrt(d_model)`
    #[must_use]
    pub fn embed_scale(&self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let scale = (self.d_model as f32).sqrt();
        scale
    }

    /// Validate dimensional invariants
    ///
    /// # Errors
    ///
    /// Returns error if any dimension is zero, `d_model` is odd, or
    /// `d_model` is not divisible by `num_heads` (the `d_model = H * d_k`
    /// invariant).
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0
            || self.num_layers == 0
            || self.num_heads == 0
            || self.vocab_size == 0
            || self.ffn_dim == 0
            || self.max_positions == 0
        {
            return Err(PortarError::InvalidShape {
                reason: "Model dimensions must be > 0".to_string(),
            });
        }
        if self.d_model % self.num_heads != 0 {
            return Err(PortarError::InvalidShape {
                reason: format!(
                    "d_model {} not divisible by num_heads {}",
                    self.d_model, self.num_heads
                ),
            });
        }
        if self.d_model % 2 != 0 {
            return Err(PortarError::InvalidShape {
                reason: format!("d_model {} must be even for sinusoidal positions", self.d_model),
            });
        }
        Ok(())
    }
}

/// One encoder layer's weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderLayer {
    /// Bidirectional self-attention
    pub self_attn: MultiHeadAttention,
    /// Post-attention layer norm
    pub self_attn_norm: LayerNorm,
    /// Feed-forward block
    pub ffn: FeedForward,
    /// Post-FFN layer norm
    pub ffn_norm: LayerNorm,
}

impl EncoderLayer {
    /// Eager forward: attention and FFN sublayers with residuals
    ///
    /// # Errors
    ///
    /// Returns error on shape mismatch.
    pub fn forward(&self, x: &Tensor<f32>, padding_mask: &Tensor<f32>) -> Result<Tensor<f32>> {
        let (attn, _, _) = self.self_attn.forward_self(x, false, Some(padding_mask))?;
        let x = self.self_attn_norm.forward(&ops::add(x, &attn)?)?;
        let ffn = self.ffn.forward(&x)?;
        self.ffn_norm.forward(&ops::add(&x, &ffn)?)
    }
}

/// One decoder layer's weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderLayer {
    /// Causal self-attention over generated tokens
    pub self_attn: MultiHeadAttention,
    /// Post-self-attention layer norm
    pub self_attn_norm: LayerNorm,
    /// Cross-attention over encoder output
    pub cross_attn: MultiHeadAttention,
    /// Post-cross-attention layer norm
    pub cross_attn_norm: LayerNorm,
    /// Feed-forward block
    pub ffn: FeedForward,
    /// Post-FFN layer norm
    pub ffn_norm: LayerNorm,
}

impl DecoderLayer {
    /// Eager forward producing this layer's cache entry
    ///
    /// With `prev: None` (first decoding step / full sequence) the
    /// self-attention is causal and cross K/V are projected from
    /// `encoder_hidden`. With a previous cache, the incoming self K/V are
    /// extended by this step's projections and the cross entries are
    /// reused unchanged; this is the passthrough the exported graph preserves as
    /// port identity.
    ///
    /// # Errors
    ///
    /// Returns error on shape mismatch.
    pub fn forward(
        &self,
        x: &Tensor<f32>,
        encoder_hidden: &Tensor<f32>,
        encoder_mask: &Tensor<f32>,
        prev: Option<&LayerCache>,
    ) -> Result<(Tensor<f32>, LayerCache)> {
        let (k_step, v_step) = self.self_attn.project_kv(x)?;
        let (self_key, self_value, causal) = match prev {
            Some(p) => (
                ops::concat(&p.self_key, &k_step, 2)?,
                ops::concat(&p.self_value, &v_step, 2)?,
                false,
            ),
            None => (k_step, v_step, true),
        };
        let attn = self
            .self_attn
            .attend(x, &self_key, &self_value, causal, None)?;
        let x = self.self_attn_norm.forward(&ops::add(x, &attn)?)?;

        let (cross_key, cross_value) = match prev {
            Some(p) => (p.cross_key.clone(), p.cross_value.clone()),
            None => self.cross_attn.project_kv(encoder_hidden)?,
        };
        let cross = self
            .cross_attn
            .attend(&x, &cross_key, &cross_value, false, Some(encoder_mask))?;
        let x = self.cross_attn_norm.forward(&ops::add(&x, &cross)?)?;

        let ffn = self.ffn.forward(&x)?;
        let x = self.ffn_norm.forward(&ops::add(&x, &ffn)?)?;

        Ok((
            x,
            LayerCache {
                self_key,
                self_value,
                cross_key,
                cross_value,
            },
        ))
    }
}

/// Encoder weight store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderStack {
    /// Token embedding table
    pub embed: Embedding,
    /// Sinusoidal position table `[max_positions, d_model]`
    pub pos_table: Tensor<f32>,
    /// Encoder layers
    pub layers: Vec<EncoderLayer>,
}

impl EncoderStack {
    /// Eager forward: token ids + padding mask → hidden states
    ///
    /// # Errors
    ///
    /// Returns error on shape mismatch or out-of-range ids.
    pub fn forward(
        &self,
        ids: &Tensor<u32>,
        padding_mask: &Tensor<f32>,
        embed_scale: f32,
    ) -> Result<Tensor<f32>> {
        let mut x = self.embed.forward(ids)?;
        x = ops::scale(&x, embed_scale)?;
        x = ops::add_position(&x, &self.pos_table, 0)?;
        for layer in &self.layers {
            x = layer.forward(&x, padding_mask)?;
        }
        Ok(x)
    }
}

/// Decoder weight store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderStack {
    /// Token embedding table
    pub embed: Embedding,
    /// Sinusoidal position table `[max_positions, d_model]`
    pub pos_table: Tensor<f32>,
    /// Decoder layers
    pub layers: Vec<DecoderLayer>,
}

impl DecoderStack {
    /// Eager forward over all layers, producing hidden states and cache
    ///
    /// Position offset is 0 without a cache and the cached self-attention
    /// length with one.
    ///
    /// # Errors
    ///
    /// Returns error on shape mismatch.
    pub fn forward(
        &self,
        ids: &Tensor<u32>,
        encoder_hidden: &Tensor<f32>,
        encoder_mask: &Tensor<f32>,
        cache: Option<&CacheState>,
        embed_scale: f32,
    ) -> Result<(Tensor<f32>, CacheState)> {
        let offset = match cache {
            Some(c) => c.self_len()?,
            None => 0,
        };

        let mut x = self.embed.forward(ids)?;
        x = ops::scale(&x, embed_scale)?;
        x = ops::add_position(&x, &self.pos_table, offset)?;

        let mut entries = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let prev = match cache {
                Some(c) => Some(c.layer(i)?),
                None => None,
            };
            let (next, entry) = layer.forward(&x, encoder_hidden, encoder_mask, prev)?;
            x = next;
            entries.push(entry);
        }
        Ok((x, CacheState::new(entries)))
    }
}

/// A loaded pretrained translation model
///
/// Weight stores sit behind `Arc` so extracted submodules are independent
/// read-only views constructed once from a shared immutable store, no
/// deep copies, and tracing one submodule cannot observe mutations from
/// tracing another because there are none.
#[derive(Debug, Clone)]
pub struct TranslationModel {
    config: ModelConfig,
    encoder: Arc<EncoderStack>,
    decoder: Arc<DecoderStack>,
    lm_head_weight: Tensor<f32>,
    final_logits_bias: Tensor<f32>,
}

/// Serialized model payload (borrowed for writing)
#[derive(Serialize)]
struct ModelFileRef<'a> {
    config: &'a ModelConfig,
    encoder: &'a EncoderStack,
    decoder: &'a DecoderStack,
    lm_head_weight: &'a Tensor<f32>,
    final_logits_bias: &'a Tensor<f32>,
}

/// Serialized model payload (owned for reading)
#[derive(Deserialize)]
struct ModelFileOwned {
    config: ModelConfig,
    encoder: EncoderStack,
    decoder: DecoderStack,
    lm_head_weight: Tensor<f32>,
    final_logits_bias: Tensor<f32>,
}

impl TranslationModel {
    /// Assemble a model from parts
    ///
    /// # Errors
    ///
    /// Returns error if the config is dimensionally invalid or the LM head
    /// shapes don't match it.
    pub fn new(
        config: ModelConfig,
        encoder: EncoderStack,
        decoder: DecoderStack,
        lm_head_weight: Tensor<f32>,
        final_logits_bias: Tensor<f32>,
    ) -> Result<Self> {
        config.validate()?;
        if lm_head_weight.shape() != [config.vocab_size, config.d_model] {
            return Err(PortarError::InvalidShape {
                reason: format!(
                    "LM head weight shape {:?} != [{}, {}]",
                    lm_head_weight.shape(),
                    config.vocab_size,
                    config.d_model
                ),
            });
        }
        if final_logits_bias.shape() != [config.vocab_size] {
            return Err(PortarError::InvalidShape {
                reason: format!(
                    "Final logits bias shape {:?} != [{}]",
                    final_logits_bias.shape(),
                    config.vocab_size
                ),
            });
        }
        Ok(Self {
            config,
            encoder: Arc::new(encoder),
            decoder: Arc::new(decoder),
            lm_head_weight,
            final_logits_bias,
        })
    }

    /// Build a randomly initialized model for fixtures and demos
    ///
    /// Weights are uniform in ±0.08, layer norms start at identity,
    /// position tables are sinusoidal. Deterministic for a given seed.
    ///
    /// # Errors
    ///
    /// Returns error if the config is dimensionally invalid.
    pub fn random(config: ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let d = config.d_model;

        let mut enc_layers = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            enc_layers.push(EncoderLayer {
                self_attn: rand_mha(&mut rng, config.num_heads, d)?,
                self_attn_norm: identity_norm(d, config.eps)?,
                ffn: rand_ffn(&mut rng, &config)?,
                ffn_norm: identity_norm(d, config.eps)?,
            });
        }
        let mut dec_layers = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            dec_layers.push(DecoderLayer {
                self_attn: rand_mha(&mut rng, config.num_heads, d)?,
                self_attn_norm: identity_norm(d, config.eps)?,
                cross_attn: rand_mha(&mut rng, config.num_heads, d)?,
                cross_attn_norm: identity_norm(d, config.eps)?,
                ffn: rand_ffn(&mut rng, &config)?,
                ffn_norm: identity_norm(d, config.eps)?,
            });
        }

        let pos_table = sinusoidal_table(config.max_positions, d)?;
        let encoder = EncoderStack {
            embed: Embedding::new(rand_tensor(&mut rng, vec![config.vocab_size, d])?)?,
            pos_table: pos_table.clone(),
            layers: enc_layers,
        };
        let decoder = DecoderStack {
            embed: Embedding::new(rand_tensor(&mut rng, vec![config.vocab_size, d])?)?,
            pos_table,
            layers: dec_layers,
        };

        let lm_head_weight = rand_tensor(&mut rng, vec![config.vocab_size, d])?;
        let final_logits_bias = rand_tensor(&mut rng, vec![config.vocab_size])?;

        Self::new(config, encoder, decoder, lm_head_weight, final_logits_bias)
    }

    /// Load a model from a `PTM` file
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure, envelope corruption, or an invalid
    /// payload.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let payload = envelope::read_envelope(MODEL_MAGIC, &bytes)?;
        let file: ModelFileOwned =
            serde_json::from_slice(payload).map_err(|e| PortarError::Format {
                reason: format!("Failed to parse model payload: {e}"),
            })?;
        Self::new(
            file.config,
            file.encoder,
            file.decoder,
            file.lm_head_weight,
            file.final_logits_bias,
        )
    }

    /// Save the model as a `PTM` file
    ///
    /// # Errors
    ///
    /// Returns error on serialization or I/O failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = ModelFileRef {
            config: &self.config,
            encoder: &*self.encoder,
            decoder: &*self.decoder,
            lm_head_weight: &self.lm_head_weight,
            final_logits_bias: &self.final_logits_bias,
        };
        let payload = serde_json::to_vec(&file).map_err(|e| PortarError::Format {
            reason: format!("Failed to serialize model: {e}"),
        })?;
        fs::write(path, envelope::write_envelope(MODEL_MAGIC, &payload))?;
        Ok(())
    }

    /// Model configuration
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Shared encoder weight store
    #[must_use]
    pub fn encoder(&self) -> &Arc<EncoderStack> {
        &self.encoder
    }

    /// Shared decoder weight store
    #[must_use]
    pub fn decoder(&self) -> &Arc<DecoderStack> {
        &self.decoder
    }

    /// Output projection weight `[vocab, d_model]`
    #[must_use]
    pub fn lm_head_weight(&self) -> &Tensor<f32> {
        &self.lm_head_weight
    }

    /// Additive bias on output logits `[vocab]`
    #[must_use]
    pub fn final_logits_bias(&self) -> &Tensor<f32> {
        &self.final_logits_bias
    }
}

fn rand_tensor(rng: &mut StdRng, shape: Vec<usize>) -> Result<Tensor<f32>> {
    let size = shape.iter().product();
    let data = (0..size).map(|_| rng.gen_range(-0.08..0.08)).collect();
    Tensor::from_vec(shape, data)
}

fn rand_linear(rng: &mut StdRng, out_features: usize, in_features: usize) -> Result<Linear> {
    Linear::new(
        rand_tensor(rng, vec![out_features, in_features])?,
        rand_tensor(rng, vec![out_features])?,
    )
}

fn rand_mha(rng: &mut StdRng, heads: usize, d: usize) -> Result<MultiHeadAttention> {
    MultiHeadAttention::new(
        heads,
        rand_linear(rng, d, d)?,
        rand_linear(rng, d, d)?,
        rand_linear(rng, d, d)?,
        rand_linear(rng, d, d)?,
    )
}

fn rand_ffn(rng: &mut StdRng, config: &ModelConfig) -> Result<FeedForward> {
    FeedForward::new(
        rand_linear(rng, config.ffn_dim, config.d_model)?,
        rand_linear(rng, config.d_model, config.ffn_dim)?,
        config.activation,
    )
}

fn identity_norm(d: usize, eps: f32) -> Result<LayerNorm> {
    LayerNorm::new(Tensor::ones(vec![d])?, Tensor::zeros(vec![d])?, eps)
}
