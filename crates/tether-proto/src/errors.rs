//! Error types for packet encoding and decoding.

use thiserror::Error;

/// Errors raised by the packet codec.
///
/// These cover structural problems only. Semantic failures (unknown data id,
/// checksum mismatch on a verified frame) are session-layer concerns and
/// surface through the session error taxonomy instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer is shorter than the structure being read from it.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum bytes required.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Write would grow the payload past its fixed capacity.
    #[error("payload overflow: {requested} more bytes exceed the {capacity} byte capacity")]
    PayloadOverflow {
        /// Bytes the caller tried to append.
        requested: usize,
        /// Remaining payload capacity.
        capacity: usize,
    },

    /// Header declares a payload larger than a frame can carry.
    #[error("payload too large: header declares {size} bytes, maximum is {max}")]
    PayloadTooLarge {
        /// Declared payload size.
        size: usize,
        /// Maximum permitted payload size.
        max: usize,
    },

    /// Footer-relevant state was mutated after the packet was finalized.
    #[error("packet has been finalized")]
    Finalized,
}

/// Convenient Result alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
