//! End-to-end pipeline tests
//!
//! Covers the full conversion flow over a small random model:
//! - 4 roles × 3 stages = 12 artifact files
//! - dynamic re-execution at different batch/sequence sizes than export
//! - the cache port-identity and growth invariants
//! - port preservation through optimization
//! - stage isolation under an injected optimization failure

use std::collections::BTreeMap;

use tempfile::TempDir;

use portar::cache::{CacheSlot, Disposition};
use portar::graph::{GraphExecutor, PortGraph, TensorValue};
use portar::layers::Activation;
use portar::model::SUPPORTED_ARCHITECTURE;
use portar::optimize::{GraphOptimizer, OptimizationPass};
use portar::{
    ConvertOptions, GraphConverter, ModelConfig, PortarError, Role, Stage, StageStatus, Tensor,
    TranslationModel,
};

// =============================================================================
// Helpers
// =============================================================================

const D_MODEL: usize = 8;
const LAYERS: usize = 2;
const HEADS: usize = 2;
const VOCAB: usize = 43;
const HEAD_DIM: usize = D_MODEL / HEADS;

fn tiny_model(seed: u64) -> TranslationModel {
    TranslationModel::random(
        ModelConfig {
            architecture: SUPPORTED_ARCHITECTURE.to_string(),
            d_model: D_MODEL,
            num_layers: LAYERS,
            num_heads: HEADS,
            vocab_size: VOCAB,
            ffn_dim: 16,
            max_positions: 64,
            activation: Activation::Gelu,
            eps: 1e-5,
        },
        seed,
    )
    .unwrap()
}

fn options(dir: &TempDir, batch_size: usize, max_length: usize) -> ConvertOptions {
    ConvertOptions {
        batch_size,
        max_length,
        ..ConvertOptions::new(dir.path())
    }
}

fn ids_tensor(batch: usize, seq: usize, fill: u32) -> TensorValue {
    TensorValue::U32(Tensor::filled(vec![batch, seq], fill % (VOCAB as u32)).unwrap())
}

fn ones(shape: Vec<usize>) -> TensorValue {
    TensorValue::F32(Tensor::ones(shape).unwrap())
}

fn filled(shape: Vec<usize>, value: f32) -> TensorValue {
    TensorValue::F32(Tensor::filled(shape, value).unwrap())
}

/// Inputs for the cached decoder with given self/cross cache lengths
fn cached_inputs(
    batch: usize,
    enc_len: usize,
    self_len: usize,
    self_fill: f32,
) -> Vec<(String, TensorValue)> {
    let mut inputs = vec![
        ("input_ids".to_string(), ids_tensor(batch, 1, 7)),
        (
            "encoder_hidden_states".to_string(),
            filled(vec![batch, enc_len, D_MODEL], 0.1),
        ),
        (
            "encoder_attention_mask".to_string(),
            ones(vec![batch, enc_len]),
        ),
    ];
    for index in 0..LAYERS * 4 {
        let (_, slot) = CacheSlot::from_flat_index(index);
        let (len, fill) = match slot.disposition() {
            Disposition::Recomputed => (self_len, self_fill),
            Disposition::Passthrough => (enc_len, 0.25),
        };
        inputs.push((
            format!("pkv_{index}"),
            filled(vec![batch, HEADS, len, HEAD_DIM], fill),
        ));
    }
    inputs
}

fn run_artifact(
    graph: &PortGraph,
    inputs: &[(String, TensorValue)],
) -> BTreeMap<String, TensorValue> {
    GraphExecutor::new(graph).run(inputs).unwrap()
}

// =============================================================================
// End-to-end scenario
// =============================================================================

#[test]
fn test_end_to_end_twelve_artifacts() {
    let dir = TempDir::new().unwrap();
    let model = tiny_model(101);
    let mut converter = GraphConverter::new(&model, options(&dir, 4, 16)).unwrap();

    let report = converter.run().unwrap().clone();
    assert!(report.all_verified(), "{report}");
    for role_report in &report.roles {
        assert_eq!(role_report.raw, StageStatus::Ok);
        assert_eq!(role_report.optimized, StageStatus::Ok);
        assert_eq!(role_report.quantized, StageStatus::Ok);
    }

    // 4 roles × 3 stages
    let mut files = 0;
    for role in Role::ALL {
        for stage in [Stage::Raw, Stage::Optimized, Stage::Quantized] {
            assert!(
                converter.store().exists(role, stage),
                "missing {role} {stage}"
            );
            files += 1;
        }
    }
    assert_eq!(files, 12);
}

#[test]
fn test_quantized_artifacts_still_execute() {
    let dir = TempDir::new().unwrap();
    let model = tiny_model(103);
    let mut converter = GraphConverter::new(&model, options(&dir, 2, 4)).unwrap();
    converter.run().unwrap();

    let graph = converter.store().load(Role::LmHead, Stage::Quantized).unwrap();
    let outputs = run_artifact(
        &graph,
        &[("input".to_string(), filled(vec![2, 1, D_MODEL], 0.5))],
    );
    let logits = outputs["output"].as_f32().unwrap();
    assert_eq!(logits.shape(), &[2, 1, VOCAB]);
    assert!(logits.data().iter().all(|v| v.is_finite()));
}

// =============================================================================
// Axis-binding consistency: export at one size, execute at another
// =============================================================================

#[test]
fn test_axis_rebinding_encoder_and_decoder() {
    let dir = TempDir::new().unwrap();
    let model = tiny_model(105);
    let mut converter = GraphConverter::new(&model, options(&dir, 2, 8)).unwrap();
    converter.convert_to_graphs().unwrap();

    // exported with batch=2, seq=8; run with batch=5, seq=13
    let encoder = converter.store().load(Role::Encoder, Stage::Raw).unwrap();
    let outputs = run_artifact(
        &encoder,
        &[
            ("input_ids".to_string(), ids_tensor(5, 13, 3)),
            ("attention_mask".to_string(), ones(vec![5, 13])),
        ],
    );
    assert_eq!(outputs["output"].as_f32().unwrap().shape(), &[5, 13, D_MODEL]);

    let decoder = converter.store().load(Role::Decoder, Stage::Raw).unwrap();
    let outputs = run_artifact(
        &decoder,
        &[
            ("input_ids".to_string(), ids_tensor(5, 6, 2)),
            (
                "encoder_hidden_states".to_string(),
                filled(vec![5, 13, D_MODEL], 0.2),
            ),
            ("encoder_attention_mask".to_string(), ones(vec![5, 13])),
        ],
    );
    assert_eq!(outputs["output"].as_f32().unwrap().shape(), &[5, 6, D_MODEL]);
    // cache ports cover the target sequence (self) and source (cross)
    assert_eq!(
        outputs["pkv_0"].as_f32().unwrap().shape(),
        &[5, HEADS, 6, HEAD_DIM]
    );
    assert_eq!(
        outputs["pkv_2"].as_f32().unwrap().shape(),
        &[5, HEADS, 13, HEAD_DIM]
    );
}

#[test]
fn test_axis_rebinding_cached_decoder_and_lm_head() {
    let dir = TempDir::new().unwrap();
    let model = tiny_model(107);
    let mut converter = GraphConverter::new(&model, options(&dir, 2, 8)).unwrap();
    converter.convert_to_graphs().unwrap();

    let cached = converter
        .store()
        .load(Role::DecoderCached, Stage::Raw)
        .unwrap();
    let outputs = run_artifact(&cached, &cached_inputs(5, 13, 9, 0.5));
    assert_eq!(outputs["output"].as_f32().unwrap().shape(), &[5, 1, D_MODEL]);
    assert_eq!(
        outputs["pkv_0o"].as_f32().unwrap().shape(),
        &[5, HEADS, 10, HEAD_DIM]
    );

    let lm_head = converter.store().load(Role::LmHead, Stage::Raw).unwrap();
    let outputs = run_artifact(
        &lm_head,
        &[("input".to_string(), filled(vec![5, 3, D_MODEL], 0.3))],
    );
    assert_eq!(outputs["output"].as_f32().unwrap().shape(), &[5, 3, VOCAB]);
}

#[test]
fn test_cached_decoder_fixed_step_width_enforced() {
    let dir = TempDir::new().unwrap();
    let model = tiny_model(109);
    let mut converter = GraphConverter::new(&model, options(&dir, 2, 4)).unwrap();
    converter.convert_to_graphs().unwrap();

    let cached = converter
        .store()
        .load(Role::DecoderCached, Stage::Raw)
        .unwrap();
    let mut inputs = cached_inputs(2, 4, 4, 1.0);
    // two tokens per step violates the fixed axis
    inputs[0] = ("input_ids".to_string(), ids_tensor(2, 2, 1));
    assert!(GraphExecutor::new(&cached).run(&inputs).is_err());
}

// =============================================================================
// Cache protocol invariants
// =============================================================================

#[test]
fn test_cross_cache_ports_bit_identical_under_varying_self_cache() {
    let dir = TempDir::new().unwrap();
    let model = tiny_model(111);
    let mut converter = GraphConverter::new(&model, options(&dir, 2, 4)).unwrap();
    converter.convert_to_graphs().unwrap();
    let cached = converter
        .store()
        .load(Role::DecoderCached, Stage::Raw)
        .unwrap();

    // same cross cache, two different self caches
    for self_fill in [0.1f32, 42.0] {
        let inputs = cached_inputs(2, 4, 3, self_fill);
        let outputs = run_artifact(&cached, &inputs);
        for layer in 0..LAYERS {
            for slot in [CacheSlot::CrossKey, CacheSlot::CrossValue] {
                let port = CacheSlot::output_port(layer, slot);
                let input_value = inputs
                    .iter()
                    .find(|(name, _)| *name == port)
                    .map(|(_, v)| v)
                    .expect("cross output port reuses the input port name");
                // bit-identical passthrough, not a recomputation
                assert_eq!(&outputs[&port], input_value, "port {port}");
            }
        }
        // self output ports are distinct names with grown state
        for layer in 0..LAYERS {
            let port = CacheSlot::output_port(layer, CacheSlot::SelfKey);
            assert!(port.ends_with('o'));
            assert_eq!(
                outputs[&port].as_f32().unwrap().shape(),
                &[2, HEADS, 4, HEAD_DIM]
            );
        }
    }
}

#[test]
fn test_self_cache_grows_by_one_per_step_cross_constant() {
    let dir = TempDir::new().unwrap();
    let model = tiny_model(113);
    let mut converter = GraphConverter::new(&model, options(&dir, 1, 4)).unwrap();
    converter.convert_to_graphs().unwrap();

    // seed the cache with the no-cache decoder
    let decoder = converter.store().load(Role::Decoder, Stage::Raw).unwrap();
    let seed_outputs = run_artifact(
        &decoder,
        &[
            ("input_ids".to_string(), ids_tensor(1, 1, 5)),
            (
                "encoder_hidden_states".to_string(),
                filled(vec![1, 4, D_MODEL], 0.15),
            ),
            ("encoder_attention_mask".to_string(), ones(vec![1, 4])),
        ],
    );

    let cached = converter
        .store()
        .load(Role::DecoderCached, Stage::Raw)
        .unwrap();
    let mut cache: Vec<TensorValue> = (0..LAYERS * 4)
        .map(|i| seed_outputs[&format!("pkv_{i}")].clone())
        .collect();

    for step in 0..3 {
        let expected_self = 1 + step;
        assert_eq!(cache[0].shape()[2], expected_self);
        assert_eq!(cache[2].shape()[2], 4); // cross stays at source length

        let mut inputs = vec![
            ("input_ids".to_string(), ids_tensor(1, 1, 9 + step as u32)),
            (
                "encoder_hidden_states".to_string(),
                filled(vec![1, 4, D_MODEL], 0.15),
            ),
            ("encoder_attention_mask".to_string(), ones(vec![1, 4])),
        ];
        for (i, value) in cache.iter().enumerate() {
            inputs.push((format!("pkv_{i}"), value.clone()));
        }
        let outputs = run_artifact(&cached, &inputs);

        // feed each step's outputs into the next step's inputs
        cache = (0..LAYERS * 4)
            .map(|i| {
                let (layer, slot) = CacheSlot::from_flat_index(i);
                outputs[&CacheSlot::output_port(layer, slot)].clone()
            })
            .collect();
        // monotone growth on the self side only
        assert_eq!(cache[0].shape()[2], expected_self + 1);
        assert_eq!(cache[1].shape()[2], expected_self + 1);
        assert_eq!(cache[2].shape()[2], 4);
        assert_eq!(cache[3].shape()[2], 4);
    }
}

// =============================================================================
// Optimization: port preservation and stage isolation
// =============================================================================

#[test]
fn test_optimization_preserves_ports_for_all_roles() {
    let dir = TempDir::new().unwrap();
    let model = tiny_model(115);
    let mut converter = GraphConverter::new(&model, options(&dir, 2, 4)).unwrap();
    converter.convert_to_graphs().unwrap();
    converter.optimize_graphs().unwrap();

    for role in Role::ALL {
        let raw = converter.store().load(role, Stage::Raw).unwrap();
        let optimized = converter.store().load(role, Stage::Optimized).unwrap();
        assert_eq!(
            raw.port_signature(),
            optimized.port_signature(),
            "ports drifted for {role}"
        );
        assert!(
            optimized.node_count() <= raw.node_count(),
            "optimization grew {role}"
        );
    }
}

#[test]
fn test_optimized_graphs_match_raw_outputs() {
    let dir = TempDir::new().unwrap();
    let model = tiny_model(117);
    let mut converter = GraphConverter::new(&model, options(&dir, 2, 4)).unwrap();
    converter.convert_to_graphs().unwrap();
    converter.optimize_graphs().unwrap();

    let inputs = vec![
        ("input_ids".to_string(), ids_tensor(3, 5, 11)),
        ("attention_mask".to_string(), ones(vec![3, 5])),
    ];
    let raw = converter.store().load(Role::Encoder, Stage::Raw).unwrap();
    let optimized = converter.store().load(Role::Encoder, Stage::Optimized).unwrap();

    let raw_out = run_artifact(&raw, &inputs);
    let opt_out = run_artifact(&optimized, &inputs);
    let a = raw_out["output"].as_f32().unwrap();
    let b = opt_out["output"].as_f32().unwrap();
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.data().iter().zip(b.data().iter()) {
        assert!((x - y).abs() <= 1e-5 + 1e-3 * y.abs());
    }
}

struct FailEverything;

impl OptimizationPass for FailEverything {
    fn name(&self) -> &'static str {
        "FailEverything"
    }
    fn run(&self, _graph: &mut PortGraph) -> portar::Result<bool> {
        Err(PortarError::Format {
            reason: "injected failure".to_string(),
        })
    }
}

#[test]
fn test_stage_isolation_injected_optimizer_failure() {
    let dir = TempDir::new().unwrap();
    let model = tiny_model(119);
    let mut converter = GraphConverter::new(&model, options(&dir, 2, 4)).unwrap();
    converter.convert_to_graphs().unwrap();

    // sabotage exactly one role's optimizer
    converter
        .optimize_graphs_with(|role| {
            if role == Role::Decoder {
                GraphOptimizer::with_passes(vec![Box::new(FailEverything)], 3)
            } else {
                GraphOptimizer::new(&Default::default())
            }
        })
        .unwrap();
    converter.quantize_graphs().unwrap();

    let report = converter.report();
    assert!(matches!(
        report.role(Role::Decoder).optimized,
        StageStatus::FellBack { .. }
    ));
    for role in [Role::Encoder, Role::DecoderCached, Role::LmHead] {
        assert_eq!(report.role(role).optimized, StageStatus::Ok);
        assert_eq!(report.role(role).quantized, StageStatus::Ok);
    }

    // the failed role still carried its raw graph forward to both stages
    for role in Role::ALL {
        assert!(converter.store().exists(role, Stage::Optimized));
        assert!(converter.store().exists(role, Stage::Quantized));
    }
}
