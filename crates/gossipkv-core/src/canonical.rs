//! Canonical wire encoding for gossipkv
//!
//! Gossip batches and codec payloads use postcard serialization:
//! - Pairs in a batch are sorted by key
//! - A batch carries at most one pair per key
//! - Field order is Rust struct field order

use crate::error::{Error, Result};
use crate::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Deserialize a value previously produced by [`canonical_bytes`].
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Sort pairs by key and keep only the highest version for each key.
pub fn normalize_batch(batch: &mut GossipBatch) {
    batch
        .pairs
        .sort_by(|a, b| a.key.cmp(&b.key).then(b.version.cmp(&a.version)));
    batch.pairs.dedup_by(|later, earlier| later.key == earlier.key);
}

/// Encode a batch for broadcast, normalizing it first.
pub fn encode_batch(mut batch: GossipBatch) -> Result<Vec<u8>> {
    normalize_batch(&mut batch);
    canonical_bytes(&batch)
}

/// Decode a broadcast batch.
pub fn decode_batch(bytes: &[u8]) -> Result<GossipBatch> {
    from_canonical_bytes(bytes)
}
