//! Error types for the binary protocol codec.

use thiserror::Error;

/// Result type for codec operations.
pub type MemdResult<T> = Result<T, MemdError>;

/// Errors produced while encoding or decoding packets.
#[derive(Debug, Error)]
pub enum MemdError {
    /// The first header byte is not a known magic.
    #[error("invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),

    /// Total body length exceeds what the client accepts.
    #[error("packet body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    /// The header lengths do not add up to the body length.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// A ULEB128 value ran past the end of its buffer or overflowed.
    #[error("invalid leb128 encoding")]
    InvalidLeb128,

    /// An alt-request frame could not be parsed.
    #[error("invalid framing extras: {0}")]
    InvalidFrame(String),

    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
