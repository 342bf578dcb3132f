//! Submodule extraction
//!
//! Pulls the four independently traceable units out of a loaded model:
//! encoder, no-cache decoder, cached decoder, and LM head. The model's
//! weights are never altered: the decoder units hold independent `Arc`
//! views of one immutable weight store, and the LM head is a fresh
//! `Linear` copied from the output projection weight and the final logits
//! bias (it dominates the parameter count, so it is traced, optimized,
//! and quantized on its own).

use std::sync::Arc;

use crate::adapter::{CachedDecoderAdapter, DecoderAdapter, DecoderModule};
use crate::error::{PortarError, Result};
use crate::graph::{AxisDim, DType, PortSpec, TensorValue, Tracer, AXIS_BATCH, AXIS_SEQ};
use crate::layers::Linear;
use crate::model::{EncoderStack, ModelConfig, TranslationModel, SUPPORTED_ARCHITECTURE};
use crate::tensor::Tensor;

fn sym(name: &str) -> AxisDim {
    AxisDim::Symbolic(name.to_string())
}

/// Source-side encoder as an independently callable unit
#[derive(Debug, Clone)]
pub struct EncoderModule {
    config: ModelConfig,
    weights: Arc<EncoderStack>,
}

impl EncoderModule {
    pub(crate) fn new(config: ModelConfig, weights: Arc<EncoderStack>) -> Self {
        Self { config, weights }
    }

    /// Model configuration
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Eager forward: token ids + padding mask → hidden states
    ///
    /// # Errors
    ///
    /// Returns error on shape mismatch or out-of-range ids.
    pub fn forward(&self, ids: &Tensor<u32>, mask: &Tensor<f32>) -> Result<Tensor<f32>> {
        self.weights.forward(ids, mask, self.config.embed_scale())
    }

    /// Trace the encoder onto example inputs
    ///
    /// Ports: `input_ids`, `attention_mask` → `output`. Every sequence
    /// tensor binds axis 0 to `batch_size` and axis 1 to `seq_length`.
    ///
    /// # Errors
    ///
    /// Returns a trace error on shape mismatch.
    pub fn trace(&self, t: &mut Tracer, ids: Tensor<u32>, mask: Tensor<f32>) -> Result<()> {
        let d = self.config.d_model;

        let ids_id = t.input(
            PortSpec {
                name: "input_ids".to_string(),
                dtype: DType::U32,
                axes: vec![sym(AXIS_BATCH), sym(AXIS_SEQ)],
            },
            TensorValue::U32(ids),
        )?;
        let mask_id = t.input(
            PortSpec {
                name: "attention_mask".to_string(),
                dtype: DType::F32,
                axes: vec![sym(AXIS_BATCH), sym(AXIS_SEQ)],
            },
            TensorValue::F32(mask),
        )?;

        let embed = t.constant("encoder.embed_tokens.weight", self.weights.embed.weight())?;
        let pos = t.constant("encoder.embed_positions.weight", &self.weights.pos_table)?;

        let mut x = t.gather(embed, ids_id)?;
        x = t.scale(x, self.config.embed_scale())?;
        x = t.add_position(x, pos, 0)?;

        for (i, layer) in self.weights.layers.iter().enumerate() {
            let prefix = format!("encoder.layers.{i}");
            let attn_name = format!("{prefix}.self_attn");
            let (k, v) = t.attention_kv(x, &layer.self_attn, &attn_name)?;
            let attn = t.attention(
                x,
                k,
                v,
                &layer.self_attn,
                false,
                Some(mask_id),
                &attn_name,
            )?;
            let sum = t.add(x, attn)?;
            x = t.layer_norm_layer(
                sum,
                &layer.self_attn_norm,
                &format!("{prefix}.self_attn_layer_norm"),
            )?;

            let ffn = t.feed_forward(x, &layer.ffn, &format!("{prefix}.ffn"))?;
            let sum = t.add(x, ffn)?;
            x = t.layer_norm_layer(sum, &layer.ffn_norm, &format!("{prefix}.final_layer_norm"))?;
        }

        t.output(
            "output",
            x,
            vec![sym(AXIS_BATCH), sym(AXIS_SEQ), AxisDim::Fixed(d)],
        );
        Ok(())
    }
}

/// Output projection head as an independently callable unit
#[derive(Debug, Clone)]
pub struct LmHeadModule {
    linear: Linear,
}

impl LmHeadModule {
    /// Wrap a projection copied out of the model
    #[must_use]
    pub fn new(linear: Linear) -> Self {
        Self { linear }
    }

    /// Vocabulary size (output features)
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.linear.out_features()
    }

    /// Eager forward: hidden states → logits
    ///
    /// # Errors
    ///
    /// Returns error on shape mismatch.
    pub fn forward(&self, hidden: &Tensor<f32>) -> Result<Tensor<f32>> {
        self.linear.forward(hidden)
    }

    /// Trace the head onto an example input
    ///
    /// Ports: `input` → `output`, both binding axis 0 to `batch_size` and
    /// axis 1 to `seq_length`.
    ///
    /// # Errors
    ///
    /// Returns a trace error on shape mismatch.
    pub fn trace(&self, t: &mut Tracer, hidden: Tensor<f32>) -> Result<()> {
        let x = t.input(
            PortSpec {
                name: "input".to_string(),
                dtype: DType::F32,
                axes: vec![
                    sym(AXIS_BATCH),
                    sym(AXIS_SEQ),
                    AxisDim::Fixed(self.linear.in_features()),
                ],
            },
            TensorValue::F32(hidden),
        )?;
        let logits = t.linear(x, &self.linear, "lm_head")?;
        t.output(
            "output",
            logits,
            vec![
                sym(AXIS_BATCH),
                sym(AXIS_SEQ),
                AxisDim::Fixed(self.linear.out_features()),
            ],
        );
        Ok(())
    }
}

/// The four extracted submodules
#[derive(Debug)]
pub struct Subgraphs {
    /// Encoder view
    pub encoder: EncoderModule,
    /// No-cache decoder (first decoding step)
    pub decoder: DecoderAdapter,
    /// Cached decoder (subsequent steps)
    pub decoder_cached: CachedDecoderAdapter,
    /// Output projection head
    pub lm_head: LmHeadModule,
}

/// Pulls submodules out of a loaded pretrained model
pub struct SubgraphExtractor;

impl SubgraphExtractor {
    /// Extract all four submodules
    ///
    /// # Errors
    ///
    /// Returns [`PortarError::UnsupportedArchitecture`] if the model's
    /// architecture tag is wrong or the expected substructure is missing.
    pub fn extract(model: &TranslationModel) -> Result<Subgraphs> {
        let config = model.config();
        if config.architecture != SUPPORTED_ARCHITECTURE {
            return Err(PortarError::UnsupportedArchitecture {
                reason: format!(
                    "architecture '{}' is not '{SUPPORTED_ARCHITECTURE}'",
                    config.architecture
                ),
            });
        }
        config
            .validate()
            .map_err(|e| PortarError::UnsupportedArchitecture {
                reason: e.to_string(),
            })?;
        if model.encoder().layers.is_empty() {
            return Err(PortarError::UnsupportedArchitecture {
                reason: "model exposes no encoder layers".to_string(),
            });
        }
        if model.decoder().layers.is_empty() {
            return Err(PortarError::UnsupportedArchitecture {
                reason: "model exposes no decoder layers".to_string(),
            });
        }

        let encoder = EncoderModule::new(config.clone(), Arc::clone(model.encoder()));

        // Two independent read-only views over the shared immutable
        // decoder store: tracing one cannot observe the other.
        let decoder = DecoderAdapter::new(DecoderModule::new(
            config.clone(),
            Arc::clone(model.decoder()),
        ));
        let decoder_cached = CachedDecoderAdapter::new(DecoderModule::new(
            config.clone(),
            Arc::clone(model.decoder()),
        ));

        let lm_head = LmHeadModule::new(Linear::new(
            model.lm_head_weight().clone(),
            model.final_logits_bias().clone(),
        )?);

        Ok(Subgraphs {
            encoder,
            decoder,
            decoder_cached,
            lm_head,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Activation;
    use crate::model::ModelConfig;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            architecture: SUPPORTED_ARCHITECTURE.to_string(),
            d_model: 8,
            num_layers: 2,
            num_heads: 2,
            vocab_size: 29,
            ffn_dim: 16,
            max_positions: 32,
            activation: Activation::Relu,
            eps: 1e-5,
        }
    }

    #[test]
    fn test_extract_supported_model() {
        let model = TranslationModel::random(tiny_config(), 3).unwrap();
        let subgraphs = SubgraphExtractor::extract(&model).unwrap();
        assert_eq!(subgraphs.lm_head.vocab_size(), 29);
    }

    #[test]
    fn test_extract_rejects_wrong_architecture() {
        let mut cfg = tiny_config();
        cfg.architecture = "decoder-only-lm".to_string();
        let model = TranslationModel::random(cfg, 3).unwrap();
        let err = SubgraphExtractor::extract(&model).unwrap_err();
        assert!(matches!(err, PortarError::UnsupportedArchitecture { .. }));
        assert!(err.to_string().contains("decoder-only-lm"));
    }

    #[test]
    fn test_extraction_does_not_copy_weights() {
        let model = TranslationModel::random(tiny_config(), 3).unwrap();
        let before = Arc::strong_count(model.decoder());
        let subgraphs = SubgraphExtractor::extract(&model).unwrap();
        // two decoder views added, zero deep copies
        assert_eq!(Arc::strong_count(model.decoder()), before + 2);
        drop(subgraphs);
        assert_eq!(Arc::strong_count(model.decoder()), before);
    }

    #[test]
    fn test_lm_head_matches_model_projection() {
        let model = TranslationModel::random(tiny_config(), 5).unwrap();
        let subgraphs = SubgraphExtractor::extract(&model).unwrap();
        let hidden = Tensor::filled(vec![1, 1, 8], 0.25).unwrap();
        let logits = subgraphs.lm_head.forward(&hidden).unwrap();
        assert_eq!(logits.shape(), &[1, 1, 29]);

        // manual projection against the model's own weights
        let w = model.lm_head_weight();
        let b = model.final_logits_bias();
        for v in 0..3 {
            let expected: f32 = (0..8).map(|j| 0.25 * w.data()[v * 8 + j]).sum::<f32>()
                + b.data()[v];
            assert!((logits.data()[v] - expected).abs() < 1e-5);
        }
    }
}
