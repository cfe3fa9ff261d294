//! Error types for FST construction, traversal, and serialization.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FstError {
    /// Malformed byte stream: unknown version, bad input-type tag, truncated
    /// data, or an illegal flag combination.
    #[error("format error: {0}")]
    Format(String),

    /// API misuse, e.g. `save` before `finish`, `finish` twice, or `pack` on
    /// an automaton that was not built with ordinal addressing.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A structural limit was exceeded (node count, block size range).
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// I/O error from the underlying byte sink or source.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, FstError>;
