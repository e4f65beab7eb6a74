//! Error types for gossipkv codecs and wire encoding

use crate::types::CodecId;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Codec and encoding errors
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// A codec is already registered under this identifier
    #[error("duplicate codec: {0}")]
    DuplicateCodec(CodecId),

    /// A value was handed to a codec that does not own its concrete type
    #[error("value type mismatch for codec {codec}: expected {expected}")]
    TypeMismatch {
        codec: CodecId,
        expected: &'static str,
    },
}
