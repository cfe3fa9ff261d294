//! Output algebra: the caller-supplied codec the automaton is generic over.
//!
//! Outputs along an accepted path are combined with [`Outputs::add`]; the
//! builder redistributes them across shared prefixes with
//! [`Outputs::common`] and [`Outputs::subtract`]. The codec also owns the
//! wire encoding of a single output value.
//!
//! Because linear-chain node bytes are written forward and then reversed,
//! while packed automatons are read forward, a codec's byte encoding is
//! always consumed in its original written order regardless of reader
//! direction; any self-delimiting sequential encoding works for both.

use std::fmt;

use crate::bytes::{ByteStore, BytesReader};
use crate::error::{FstError, Result};

/// Codec for one output type: identity element, wire format, and the
/// monoid operations the builder needs.
pub trait Outputs {
    type Value: Clone + PartialEq + fmt::Debug;

    /// The "no output" sentinel. Arcs carrying this value are encoded
    /// without an output payload.
    fn no_output(&self) -> Self::Value;

    /// Encode an arc output.
    fn write(&self, output: &Self::Value, out: &mut ByteStore) -> Result<()>;

    /// Encode a final output. Defaults to the arc encoding.
    fn write_final_output(&self, output: &Self::Value, out: &mut ByteStore) -> Result<()> {
        self.write(output, out)
    }

    /// Decode an arc output.
    fn read(&self, reader: &mut dyn BytesReader) -> Result<Self::Value>;

    /// Decode a final output. Defaults to the arc decoding.
    fn read_final_output(&self, reader: &mut dyn BytesReader) -> Result<Self::Value> {
        self.read(reader)
    }

    /// Combine the outputs of a duplicated input (used when the same input
    /// is added twice, including a repeated empty input).
    fn merge(&self, _a: &Self::Value, _b: &Self::Value) -> Result<Self::Value> {
        Err(FstError::IllegalState(
            "this output codec does not support merging duplicate inputs".to_string(),
        ))
    }

    /// The common prefix (infimum) of two outputs.
    fn common(&self, a: &Self::Value, b: &Self::Value) -> Self::Value;

    /// Remove `b` (a prior `common` result) from the front of `a`.
    fn subtract(&self, a: &Self::Value, b: &Self::Value) -> Self::Value;

    /// Prepend `prefix` to `suffix`.
    fn add(&self, prefix: &Self::Value, suffix: &Self::Value) -> Self::Value;
}

/// Non-negative integer outputs under addition.
///
/// The value summed along a path is the result of a lookup; `0` is the
/// no-output identity. Values are vlong on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositiveIntOutputs;

impl Outputs for PositiveIntOutputs {
    type Value = u64;

    fn no_output(&self) -> u64 {
        0
    }

    fn write(&self, output: &u64, out: &mut ByteStore) -> Result<()> {
        out.write_vlong(*output);
        Ok(())
    }

    fn read(&self, reader: &mut dyn BytesReader) -> Result<u64> {
        reader.read_vlong()
    }

    fn common(&self, a: &u64, b: &u64) -> u64 {
        (*a).min(*b)
    }

    fn subtract(&self, a: &u64, b: &u64) -> u64 {
        debug_assert!(b <= a);
        a - b
    }

    fn add(&self, prefix: &u64, suffix: &u64) -> u64 {
        prefix + suffix
    }
}
