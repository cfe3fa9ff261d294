//! Byte-serialized finite state transducer for term dictionaries.
//!
//! An acyclic automaton mapping sorted input label sequences (bytes,
//! 16-bit units, or 32-bit codepoints) to outputs of a caller-supplied
//! monoid, stored in one compact byte buffer. Built incrementally from
//! sorted `(input, output)` pairs, then traversed, serialized, or
//! rewritten into a smaller packed form.
//!
//! ## Layers
//!
//! - [`bytes`] -- paged append-only byte buffer, forward/reverse readers
//! - [`outputs`] -- the output monoid codec ([`PositiveIntOutputs`] ships)
//! - [`packed_ints`] -- byte-width-packed integer tables
//! - [`fst`] -- the automaton: node/arc wire format, encoder, arc reader,
//!   root-arc cache, save/load
//! - [`builder`] -- minimal-automaton construction with suffix sharing
//! - [`packer`] -- the pack rewrite (dense ids + delta-coded pointers)
//!
//! ## Example
//!
//! ```
//! use lexfst::{Arc, Builder, InputType, PositiveIntOutputs, END_LABEL};
//!
//! let mut builder = Builder::new(InputType::Byte1, PositiveIntOutputs);
//! builder.add(&[b'c' as i32, b'a' as i32, b'r' as i32], 5).unwrap();
//! builder.add(&[b'c' as i32, b'a' as i32, b't' as i32], 3).unwrap();
//! let fst = builder.finish().unwrap();
//!
//! let mut reader = fst.bytes_reader();
//! let mut arc = Arc::new(0u64);
//! fst.first_arc(&mut arc);
//! let mut sum = 0;
//! for &label in &[b'c' as i32, b'a' as i32, b't' as i32, END_LABEL] {
//!     let follow = arc.clone();
//!     assert!(fst.find_target_arc(label, &follow, &mut arc, &mut reader).unwrap());
//!     sum += arc.output;
//! }
//! assert_eq!(sum, 3);
//! ```

pub mod builder;
pub mod bytes;
pub mod error;
pub mod fst;
pub mod outputs;
pub mod packed_ints;
pub mod packer;

pub use builder::{Builder, BuilderOptions};
pub use bytes::{ByteStore, BytesReader, ForwardBytesReader, ReverseBytesReader, StoreBytesReader};
pub use error::{FstError, Result};
pub use fst::{Arc, Fst, InputType, DEFAULT_MAX_BLOCK_BITS, END_LABEL};
pub use outputs::{Outputs, PositiveIntOutputs};
