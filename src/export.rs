//! Graph export
//!
//! Traces each submodule against representative example inputs and writes
//! the raw artifact. Example values are synthetic (random token ids
//! within vocabulary range, all-ones masks, random hidden states, a cache
//! of ones) because only shapes matter to tracing; values exist so the
//! verifier has something to compare. The RNG is seeded per role, making
//! every export deterministic given fixed weights and fixed shapes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::adapter::{CachedDecoderAdapter, DecoderAdapter};
use crate::error::{PortarError, Result};
use crate::extract::{EncoderModule, LmHeadModule};
use crate::graph::{ArtifactStore, ExportArtifact, Role, Stage, TensorValue, Tracer};
use crate::tensor::Tensor;

/// The result of exporting one role: the artifact plus the example bundle
/// the verifier replays
pub struct ExportOutcome {
    /// Written raw artifact
    pub artifact: ExportArtifact,
    /// Named example inputs used for tracing
    pub example_inputs: Vec<(String, TensorValue)>,
    /// Primary eager output on those inputs
    pub eager_output: Tensor<f32>,
}

/// Traces submodules and writes raw artifacts
pub struct GraphExporter {
    batch_size: usize,
    max_length: usize,
    seed: u64,
}

impl GraphExporter {
    /// Create an exporter
    ///
    /// `batch_size` and `max_length` only size the example inputs; the
    /// exported graphs stay dynamically shaped through their symbolic
    /// axis bindings.
    ///
    /// # Errors
    ///
    /// Returns error if either sizing parameter is zero.
    pub fn new(batch_size: usize, max_length: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 || max_length == 0 {
            return Err(PortarError::InvalidShape {
                reason: "batch_size and max_length must be > 0".to_string(),
            });
        }
        Ok(Self {
            batch_size,
            max_length,
            seed,
        })
    }

    fn rng(&self, role: Role) -> StdRng {
        // distinct stream per role, stable across runs
        let salt = match role {
            Role::Encoder => 1,
            Role::Decoder => 2,
            Role::DecoderCached => 3,
            Role::LmHead => 4,
        };
        StdRng::seed_from_u64(self.seed.wrapping_mul(31).wrapping_add(salt))
    }

    fn random_ids(rng: &mut StdRng, shape: Vec<usize>, vocab: usize) -> Result<Tensor<u32>> {
        let size = shape.iter().product();
        #[allow(clippy::cast_possible_truncation)]
        let data = (0..size)
            .map(|_| rng.gen_range(0..vocab) as u32)
            .collect();
        Tensor::from_vec(shape, data)
    }

    fn random_hidden(rng: &mut StdRng, shape: Vec<usize>) -> Result<Tensor<f32>> {
        let size = shape.iter().product();
        let data = (0..size).map(|_| rng.gen_range(0.0..1.0)).collect();
        Tensor::from_vec(shape, data)
    }

    /// Export the encoder
    ///
    /// # Errors
    ///
    /// Returns error on trace capture or write failure.
    pub fn export_encoder(
        &self,
        module: &EncoderModule,
        store: &ArtifactStore,
    ) -> Result<ExportOutcome> {
        let mut rng = self.rng(Role::Encoder);
        let vocab = module.config().vocab_size;
        let ids = Self::random_ids(&mut rng, vec![self.batch_size, self.max_length], vocab)?;
        let mask = Tensor::ones(vec![self.batch_size, self.max_length])?;

        let eager_output = module.forward(&ids, &mask)?;

        let mut tracer = Tracer::new(Role::Encoder);
        module.trace(&mut tracer, ids.clone(), mask.clone())?;
        let graph = tracer.finish();
        let artifact = store.write(Role::Encoder, Stage::Raw, &graph)?;
        info!(role = %Role::Encoder, nodes = graph.node_count(), "exported");

        Ok(ExportOutcome {
            artifact,
            example_inputs: vec![
                ("input_ids".to_string(), TensorValue::U32(ids)),
                ("attention_mask".to_string(), TensorValue::F32(mask)),
            ],
            eager_output,
        })
    }

    /// Export the no-cache decoder
    ///
    /// # Errors
    ///
    /// Returns error on trace capture or write failure.
    pub fn export_decoder(
        &self,
        adapter: &DecoderAdapter,
        store: &ArtifactStore,
    ) -> Result<ExportOutcome> {
        let mut rng = self.rng(Role::Decoder);
        let config = adapter.config();
        let ids = Self::random_ids(
            &mut rng,
            vec![self.batch_size, self.max_length],
            config.vocab_size,
        )?;
        let encoder_hidden = Self::random_hidden(
            &mut rng,
            vec![self.batch_size, self.max_length, config.d_model],
        )?;
        let mask = Tensor::ones(vec![self.batch_size, self.max_length])?;

        let (eager_output, _cache) = adapter.forward_flat(&ids, &encoder_hidden, &mask)?;

        let mut tracer = Tracer::new(Role::Decoder);
        adapter.trace(
            &mut tracer,
            ids.clone(),
            encoder_hidden.clone(),
            mask.clone(),
        )?;
        let graph = tracer.finish();
        let artifact = store.write(Role::Decoder, Stage::Raw, &graph)?;
        info!(role = %Role::Decoder, nodes = graph.node_count(), "exported");

        Ok(ExportOutcome {
            artifact,
            example_inputs: vec![
                ("input_ids".to_string(), TensorValue::U32(ids)),
                (
                    "encoder_hidden_states".to_string(),
                    TensorValue::F32(encoder_hidden),
                ),
                ("encoder_attention_mask".to_string(), TensorValue::F32(mask)),
            ],
            eager_output,
        })
    }

    /// Export the cached decoder
    ///
    /// The example cache is all-ones with `max_length` prior positions,
    /// matching the original export recipe.
    ///
    /// # Errors
    ///
    /// Returns error on trace capture or write failure.
    pub fn export_decoder_cached(
        &self,
        adapter: &CachedDecoderAdapter,
        store: &ArtifactStore,
    ) -> Result<ExportOutcome> {
        let mut rng = self.rng(Role::DecoderCached);
        let config = adapter.config();
        let ids = Self::random_ids(&mut rng, vec![self.batch_size, 1], config.vocab_size)?;
        let encoder_hidden = Self::random_hidden(
            &mut rng,
            vec![self.batch_size, self.max_length, config.d_model],
        )?;
        let mask = Tensor::ones(vec![self.batch_size, self.max_length])?;

        let cache_shape = vec![
            self.batch_size,
            config.num_heads,
            self.max_length,
            config.head_dim(),
        ];
        let cache: Vec<Tensor<f32>> = (0..config.num_layers * 4)
            .map(|_| Tensor::ones(cache_shape.clone()))
            .collect::<Result<_>>()?;

        let (eager_output, _cache_out) =
            adapter.forward_flat(&ids, &encoder_hidden, &mask, cache.clone())?;

        let mut tracer = Tracer::new(Role::DecoderCached);
        adapter.trace(
            &mut tracer,
            ids.clone(),
            encoder_hidden.clone(),
            mask.clone(),
            cache.clone(),
        )?;
        let graph = tracer.finish();
        let artifact = store.write(Role::DecoderCached, Stage::Raw, &graph)?;
        info!(role = %Role::DecoderCached, nodes = graph.node_count(), "exported");

        let mut example_inputs = vec![
            ("input_ids".to_string(), TensorValue::U32(ids)),
            (
                "encoder_hidden_states".to_string(),
                TensorValue::F32(encoder_hidden),
            ),
            ("encoder_attention_mask".to_string(), TensorValue::F32(mask)),
        ];
        for (i, entry) in cache.into_iter().enumerate() {
            example_inputs.push((format!("pkv_{i}"), TensorValue::F32(entry)));
        }

        Ok(ExportOutcome {
            artifact,
            example_inputs,
            eager_output,
        })
    }

    /// Export the LM head
    ///
    /// # Errors
    ///
    /// Returns error on trace capture or write failure.
    pub fn export_lm_head(
        &self,
        module: &LmHeadModule,
        store: &ArtifactStore,
        d_model: usize,
    ) -> Result<ExportOutcome> {
        let mut rng = self.rng(Role::LmHead);
        let hidden = Self::random_hidden(&mut rng, vec![self.batch_size, 1, d_model])?;

        let eager_output = module.forward(&hidden)?;

        let mut tracer = Tracer::new(Role::LmHead);
        module.trace(&mut tracer, hidden.clone())?;
        let graph = tracer.finish();
        let artifact = store.write(Role::LmHead, Stage::Raw, &graph)?;
        info!(role = %Role::LmHead, nodes = graph.node_count(), "exported");

        Ok(ExportOutcome {
            artifact,
            example_inputs: vec![("input".to_string(), TensorValue::F32(hidden))],
            eager_output,
        })
    }
}
