//! Decoder attention cache schema
//!
//! The decoder's native cache is a nested per-layer structure. The exported
//! graphs exchange it as a flat, fixed-length, ordered sequence of tensors
//! instead, an explicit schema a name-addressable runtime can bind to.
//!
//! ## Flat layout
//!
//! ```text
//! index 4·l + 0   self_key     [batch, heads, seq, d_k]   recomputed
//! index 4·l + 1   self_value   [batch, heads, seq, d_k]   recomputed
//! index 4·l + 2   cross_key    [batch, heads, seq, d_k]   passthrough
//! index 4·l + 3   cross_value  [batch, heads, seq, d_k]   passthrough
//! ```
//!
//! Layer-major: all four slots of layer 0, then layer 1, and so on. Input
//! ports are named `pkv_{i}`; output ports for recomputed slots append an
//! `o` suffix (`pkv_{i}o`) while passthrough slots reuse the input name,
//! signalling to a memoizing runtime that the tensor is unchanged.
//!
//! Self-attention entries grow by one time step per decoded token and must
//! be fed back each call. Cross-attention entries are derived solely from
//! the encoder output, which is fixed for the duration of one source
//! sequence, so they are computed once and reused unchanged.

use serde::{Deserialize, Serialize};

use crate::error::{PortarError, Result};
use crate::tensor::Tensor;

/// Whether a cache slot is replaced or reused across decoding steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Output tensor is logically distinct from the input (grown by one
    /// time step); must be fed back on the next call
    Recomputed,
    /// Output tensor is identical in value and port identity to the input;
    /// a caller memoizing by port name may skip re-feeding it
    Passthrough,
}

/// One of the four cache slots each decoder layer owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheSlot {
    /// Keys over previously generated target tokens
    SelfKey,
    /// Values over previously generated target tokens
    SelfValue,
    /// Keys derived from the encoder output
    CrossKey,
    /// Values derived from the encoder output
    CrossValue,
}

impl CacheSlot {
    /// Slots in flat layout order within one layer
    pub const PER_LAYER: [CacheSlot; 4] = [
        CacheSlot::SelfKey,
        CacheSlot::SelfValue,
        CacheSlot::CrossKey,
        CacheSlot::CrossValue,
    ];

    /// Whether this slot is recomputed each step or passed through
    #[must_use]
    pub fn disposition(self) -> Disposition {
        match self {
            CacheSlot::SelfKey | CacheSlot::SelfValue => Disposition::Recomputed,
            CacheSlot::CrossKey | CacheSlot::CrossValue => Disposition::Passthrough,
        }
    }

    /// Offset of this slot within its layer's 4-entry group
    #[must_use]
    pub fn offset(self) -> usize {
        match self {
            CacheSlot::SelfKey => 0,
            CacheSlot::SelfValue => 1,
            CacheSlot::CrossKey => 2,
            CacheSlot::CrossValue => 3,
        }
    }

    /// Flat index of `(layer, slot)` in layer-major order
    #[must_use]
    pub fn flat_index(self, layer: usize) -> usize {
        layer * 4 + self.offset()
    }

    /// Decompose a flat index into `(layer, slot)`
    #[must_use]
    pub fn from_flat_index(index: usize) -> (usize, CacheSlot) {
        (index / 4, Self::PER_LAYER[index % 4])
    }

    /// Input port name for flat index `i`: `pkv_{i}`
    #[must_use]
    pub fn input_port(layer: usize, slot: CacheSlot) -> String {
        format!("pkv_{}", slot.flat_index(layer))
    }

    /// Output port name for flat index `i`
    ///
    /// Recomputed slots get a distinct suffixed name; passthrough slots
    /// reuse the input name, the port-identity convention downstream
    /// runtimes rely on to skip redundant work.
    #[must_use]
    pub fn output_port(layer: usize, slot: CacheSlot) -> String {
        let index = slot.flat_index(layer);
        match slot.disposition() {
            Disposition::Recomputed => format!("pkv_{index}o"),
            Disposition::Passthrough => format!("pkv_{index}"),
        }
    }
}

/// Cache entries for one decoder layer
///
/// Each tensor is `[batch, heads, seq, d_k]`; self and cross entries may
/// have different sequence lengths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCache {
    /// Self-attention keys
    pub self_key: Tensor<f32>,
    /// Self-attention values
    pub self_value: Tensor<f32>,
    /// Cross-attention keys
    pub cross_key: Tensor<f32>,
    /// Cross-attention values
    pub cross_value: Tensor<f32>,
}

/// Ordered cache entries for all decoder layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheState {
    layers: Vec<LayerCache>,
}

impl CacheState {
    /// Build a cache state from per-layer entries
    #[must_use]
    pub fn new(layers: Vec<LayerCache>) -> Self {
        Self { layers }
    }

    /// Number of decoder layers
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Per-layer entries
    #[must_use]
    pub fn layers(&self) -> &[LayerCache] {
        &self.layers
    }

    /// Entry for one layer
    ///
    /// # Errors
    ///
    /// Returns error if `layer` is out of range.
    pub fn layer(&self, layer: usize) -> Result<&LayerCache> {
        self.layers.get(layer).ok_or_else(|| PortarError::InvalidShape {
            reason: format!(
                "Cache layer {layer} out of range ({} layers)",
                self.layers.len()
            ),
        })
    }

    /// Self-attention sequence length (layer 0)
    ///
    /// # Errors
    ///
    /// Returns error if the cache is empty.
    pub fn self_len(&self) -> Result<usize> {
        self.layer(0)?.self_key.dim(2)
    }

    /// Cross-attention sequence length (layer 0)
    ///
    /// # Errors
    ///
    /// Returns error if the cache is empty.
    pub fn cross_len(&self) -> Result<usize> {
        self.layer(0)?.cross_key.dim(2)
    }

    /// Flatten into layer-major slot order, consuming the cache
    #[must_use]
    pub fn into_flat(self) -> Vec<Tensor<f32>> {
        let mut out = Vec::with_capacity(self.layers.len() * 4);
        for layer in self.layers {
            out.push(layer.self_key);
            out.push(layer.self_value);
            out.push(layer.cross_key);
            out.push(layer.cross_value);
        }
        out
    }

    /// Borrow entries in layer-major slot order
    #[must_use]
    pub fn flat(&self) -> Vec<&Tensor<f32>> {
        let mut out = Vec::with_capacity(self.layers.len() * 4);
        for layer in &self.layers {
            out.push(&layer.self_key);
            out.push(&layer.self_value);
            out.push(&layer.cross_key);
            out.push(&layer.cross_value);
        }
        out
    }

    /// Rebuild from a flat layer-major sequence of `4·L` tensors
    ///
    /// # Errors
    ///
    /// Returns error if the tensor count is not a multiple of 4 or any
    /// entry is not rank 4.
    pub fn from_flat(tensors: Vec<Tensor<f32>>) -> Result<Self> {
        if tensors.is_empty() || tensors.len() % 4 != 0 {
            return Err(PortarError::InvalidShape {
                reason: format!(
                    "Flat cache must hold 4·L tensors, got {}",
                    tensors.len()
                ),
            });
        }
        for (i, t) in tensors.iter().enumerate() {
            if t.ndim() != 4 {
                return Err(PortarError::InvalidShape {
                    reason: format!(
                        "Cache entry {i} must be rank 4 [batch, heads, seq, d_k], got rank {}",
                        t.ndim()
                    ),
                });
            }
        }

        let mut layers = Vec::with_capacity(tensors.len() / 4);
        let mut iter = tensors.into_iter();
        while let (Some(sk), Some(sv), Some(ck), Some(cv)) =
            (iter.next(), iter.next(), iter.next(), iter.next())
        {
            layers.push(LayerCache {
                self_key: sk,
                self_value: sv,
                cross_key: ck,
                cross_value: cv,
            });
        }
        Ok(Self { layers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: usize, fill: f32) -> Tensor<f32> {
        Tensor::filled(vec![1, 2, seq, 3], fill).unwrap()
    }

    fn layer(seq_self: usize, seq_cross: usize) -> LayerCache {
        LayerCache {
            self_key: entry(seq_self, 0.0),
            self_value: entry(seq_self, 1.0),
            cross_key: entry(seq_cross, 2.0),
            cross_value: entry(seq_cross, 3.0),
        }
    }

    #[test]
    fn test_disposition_per_slot() {
        assert_eq!(CacheSlot::SelfKey.disposition(), Disposition::Recomputed);
        assert_eq!(CacheSlot::SelfValue.disposition(), Disposition::Recomputed);
        assert_eq!(CacheSlot::CrossKey.disposition(), Disposition::Passthrough);
        assert_eq!(CacheSlot::CrossValue.disposition(), Disposition::Passthrough);
    }

    #[test]
    fn test_flat_index_roundtrip() {
        for layer in 0..3 {
            for slot in CacheSlot::PER_LAYER {
                let idx = slot.flat_index(layer);
                assert_eq!(CacheSlot::from_flat_index(idx), (layer, slot));
            }
        }
        assert_eq!(CacheSlot::CrossValue.flat_index(2), 11);
    }

    #[test]
    fn test_port_names_follow_disposition() {
        assert_eq!(CacheSlot::input_port(0, CacheSlot::SelfKey), "pkv_0");
        assert_eq!(CacheSlot::output_port(0, CacheSlot::SelfKey), "pkv_0o");
        assert_eq!(CacheSlot::output_port(0, CacheSlot::SelfValue), "pkv_1o");
        assert_eq!(CacheSlot::output_port(0, CacheSlot::CrossKey), "pkv_2");
        assert_eq!(CacheSlot::output_port(1, CacheSlot::CrossValue), "pkv_7");
        assert_eq!(CacheSlot::output_port(1, CacheSlot::SelfKey), "pkv_4o");
    }

    #[test]
    fn test_flatten_roundtrip() {
        let state = CacheState::new(vec![layer(2, 5), layer(2, 5)]);
        assert_eq!(state.num_layers(), 2);
        assert_eq!(state.self_len().unwrap(), 2);
        assert_eq!(state.cross_len().unwrap(), 5);

        let flat = state.clone().into_flat();
        assert_eq!(flat.len(), 8);
        let rebuilt = CacheState::from_flat(flat).unwrap();
        assert_eq!(rebuilt, state);
    }

    #[test]
    fn test_from_flat_rejects_bad_count() {
        let tensors = vec![entry(1, 0.0); 3];
        assert!(CacheState::from_flat(tensors).is_err());
        assert!(CacheState::from_flat(Vec::new()).is_err());
    }

    #[test]
    fn test_from_flat_rejects_wrong_rank() {
        let mut tensors = vec![entry(1, 0.0); 3];
        tensors.push(Tensor::filled(vec![2, 2], 0.0).unwrap());
        assert!(CacheState::from_flat(tensors).is_err());
    }
}
