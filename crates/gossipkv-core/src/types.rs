//! Core data model for gossipkv
//!
//! Stored values are opaque to the store: a [`Value`] is a type-erased,
//! immutable payload that only the codec named by its [`CodecId`] can
//! interpret. Wire types are designed for postcard serialization.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Small integer tag naming the codec that owns a value
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodecId(pub u16);

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "codec#{}", self.0)
    }
}

// =============================================================================
// STORED VALUES
// =============================================================================

/// Type-erased, immutable codec payload.
///
/// Cloning is cheap and never copies the payload; once a value is stored it is
/// never mutated again, so every clone observes the same contents.
#[derive(Clone)]
pub struct Value(Arc<dyn Any + Send + Sync>);

impl Value {
    /// Wrap a concrete payload
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    /// Borrow the payload as its concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.0).downcast_ref::<T>()
    }

    /// Whether both handles point at the same payload
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Value(..)")
    }
}

/// A versioned, codec-tagged value as held by a replica
#[derive(Clone, Debug)]
pub struct ValueDescriptor {
    /// Codec-specific payload
    pub value: Value,
    /// Local per-key counter, bumped on every accepted mutation
    pub version: u64,
    /// Codec owning `value`
    pub codec: CodecId,
}

impl ValueDescriptor {
    pub fn new(value: Value, version: u64, codec: CodecId) -> Self {
        Self {
            value,
            version,
            codec,
        }
    }

    /// Borrow the payload as its concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

/// One encoded (key, descriptor) pair as carried in gossip
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValuePair {
    pub key: String,
    /// Codec-encoded payload
    pub value: Vec<u8>,
    pub codec: CodecId,
    pub version: u64,
}

/// A batch of pairs broadcast in a single gossip message
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GossipBatch {
    pub pairs: Vec<KeyValuePair>,
}

impl GossipBatch {
    pub fn new(pairs: Vec<KeyValuePair>) -> Self {
        Self { pairs }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_downcast() {
        let value = Value::new(42u64);
        assert_eq!(value.downcast_ref::<u64>(), Some(&42));
        assert!(value.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_value_clone_shares_payload() {
        let value = Value::new(String::from("ring"));
        let copy = value.clone();
        assert!(value.ptr_eq(&copy));
        assert!(!value.ptr_eq(&Value::new(String::from("ring"))));
    }

    #[test]
    fn test_codec_id_display() {
        assert_eq!(CodecId(7).to_string(), "codec#7");
    }
}
