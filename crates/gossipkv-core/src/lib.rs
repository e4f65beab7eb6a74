//! gossipkv core library
//!
//! This crate provides the data model, the pluggable codec capability and the
//! canonical wire encoding for the gossipkv replicated key-value store.
//!
//! # Modules
//!
//! - [`types`]: Stored values, descriptors and wire pairs
//! - [`codec`]: The codec capability and the [`Mergeable`] adapter
//! - [`codecs`]: Built-in counters and last-writer-wins types
//! - [`registry`]: Dispatch table from codec id to codec
//! - [`canonical`]: Deterministic postcard encoding of gossip batches
//! - [`error`]: Error types

pub mod canonical;
pub mod codec;
pub mod codecs;
pub mod error;
pub mod registry;
pub mod types;

#[cfg(test)]
mod laws;

pub use codec::{Codec, Mergeable, TypedCodec};
pub use error::{Error, Result};
pub use registry::CodecRegistry;
pub use types::*;
