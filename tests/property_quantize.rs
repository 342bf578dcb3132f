//! Property tests for quantization and the file envelope

use proptest::prelude::*;

use portar::envelope::{read_envelope, write_envelope};
use portar::quantize::{dequantize_q8, quantize_tensor, Q8Block, BLOCK_SIZE};
use portar::Tensor;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Round-trip error of one block stays within half a quantization step
    #[test]
    fn prop_q8_block_error_bounded(
        values in prop::collection::vec(-100.0f32..100.0, 1..=BLOCK_SIZE)
    ) {
        let block = Q8Block::quantize(&values);
        let bound = block.scale * 0.5 + 1e-6;
        prop_assert!(block.quantization_error(&values) <= bound);
    }

    /// The scale is always positive and the largest magnitude maps near 127
    #[test]
    fn prop_q8_block_scale_positive(
        values in prop::collection::vec(-10.0f32..10.0, BLOCK_SIZE)
    ) {
        let block = Q8Block::quantize(&values);
        prop_assert!(block.scale > 0.0);
        let max_q = block.quants.iter().map(|q| i16::from(*q).unsigned_abs()).max().unwrap();
        let max_abs = values.iter().fold(0.0f32, |a, v| a.max(v.abs()));
        if max_abs > 1e-6 {
            prop_assert!(max_q >= 126, "max quant {} for max_abs {}", max_q, max_abs);
        }
    }

    /// Tensor-level quantization preserves shape and bounds error per block
    #[test]
    fn prop_quantize_tensor_roundtrip(
        rows in 1usize..6,
        cols in 1usize..50,
        seed in 0u64..1000
    ) {
        let size = rows * cols;
        let data: Vec<f32> = (0..size)
            .map(|i| {
                let x = (i as u64).wrapping_mul(seed.wrapping_add(1)) % 1000;
                (x as f32 - 500.0) * 0.01
            })
            .collect();
        let tensor = Tensor::from_vec(vec![rows, cols], data.clone()).unwrap();

        let (scales, quants) = quantize_tensor(&tensor);
        prop_assert_eq!(scales.len(), size.div_ceil(BLOCK_SIZE));
        prop_assert_eq!(quants.len(), scales.len() * BLOCK_SIZE);

        let back = dequantize_q8(&scales, &quants, &[rows, cols]).unwrap();
        prop_assert_eq!(back.shape(), &[rows, cols]);
        for (i, (a, b)) in data.iter().zip(back.data().iter()).enumerate() {
            let bound = scales[i / BLOCK_SIZE] * 0.5 + 1e-6;
            prop_assert!((a - b).abs() <= bound, "element {}: {} vs {}", i, a, b);
        }
    }

    /// Envelope round-trips arbitrary payloads and never accepts wrong magic
    #[test]
    fn prop_envelope_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..512)) {
        let bytes = write_envelope(*b"PRP\0", &payload);
        let back = read_envelope(*b"PRP\0", &bytes).unwrap();
        prop_assert_eq!(back, payload.as_slice());
        prop_assert!(read_envelope(*b"XXX\0", &bytes).is_err());
    }

    /// Flipping one payload byte is detected by the checksum
    #[test]
    fn prop_envelope_detects_flip(
        payload in prop::collection::vec(any::<u8>(), 1..128),
        flip_index in 0usize..128,
        flip_bit in 0u8..8
    ) {
        let mut bytes = write_envelope(*b"PRP\0", &payload);
        let header = bytes.len() - payload.len();
        let index = header + (flip_index % payload.len());
        bytes[index] ^= 1 << flip_bit;
        prop_assert!(read_envelope(*b"PRP\0", &bytes).is_err());
    }
}
