//! The codec capability: how one category of value is encoded, decoded and
//! merged.
//!
//! # Merge laws
//!
//! The store never orders or deduplicates gossip; convergence relies entirely
//! on every codec's merge being
//! - commutative: merging A then B yields the same value as B then A,
//! - idempotent: merging a value already folded in reports no change,
//! - associative: grouping of successive merges does not matter,
//! - deterministic: no clocks, randomness or node-local state.
//!
//! These laws are not checked at runtime. Anyone adding a codec owns them.

use crate::canonical::{canonical_bytes, from_canonical_bytes};
use crate::error::{Error, Result};
use crate::types::{CodecId, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::marker::PhantomData;

/// Dynamically dispatched codec, selected by the [`CodecId`] stored beside
/// each value.
pub trait Codec: Send + Sync {
    /// Identifier this codec is registered under
    fn id(&self) -> CodecId;

    /// Human readable name for diagnostics
    fn name(&self) -> &str;

    /// Value assumed for a key that has never been written
    fn zero(&self) -> Value;

    fn decode(&self, bytes: &[u8]) -> Result<Value>;

    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Check that `value` is of this codec's concrete type
    fn check(&self, value: &Value) -> Result<()>;

    /// Merge `remote` into `local` without mutating either.
    ///
    /// Returns `Some(merged)` if the result differs from `local`, `None` if
    /// `remote` carried nothing new.
    fn merge(&self, local: &Value, remote: &Value) -> Result<Option<Value>>;

    /// Render a value for diagnostics
    fn render(&self, value: &Value) -> String;
}

/// A concrete value type with a state-based merge.
pub trait Mergeable: Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fold `other` into `self`, returning whether `self` changed.
    fn merge_from(&mut self, other: &Self) -> bool;
}

/// Adapts any [`Mergeable`] type into a [`Codec`] using postcard encoding.
pub struct TypedCodec<T> {
    id: CodecId,
    name: String,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Mergeable> TypedCodec<T> {
    pub fn new(id: CodecId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            _phantom: PhantomData,
        }
    }

    fn typed<'a>(&self, value: &'a Value) -> Result<&'a T> {
        value.downcast_ref::<T>().ok_or(Error::TypeMismatch {
            codec: self.id,
            expected: std::any::type_name::<T>(),
        })
    }
}

impl<T> Debug for TypedCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCodec")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl<T: Mergeable> Codec for TypedCodec<T> {
    fn id(&self) -> CodecId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn zero(&self) -> Value {
        Value::new(T::default())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let decoded: T = from_canonical_bytes(bytes)?;
        Ok(Value::new(decoded))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        canonical_bytes(self.typed(value)?)
    }

    fn check(&self, value: &Value) -> Result<()> {
        self.typed(value).map(|_| ())
    }

    fn merge(&self, local: &Value, remote: &Value) -> Result<Option<Value>> {
        let mut merged = self.typed(local)?.clone();
        if merged.merge_from(self.typed(remote)?) {
            Ok(Some(Value::new(merged)))
        } else {
            Ok(None)
        }
    }

    fn render(&self, value: &Value) -> String {
        match value.downcast_ref::<T>() {
            Some(typed) => format!("{:?}", typed),
            None => format!("<not a {}>", self.name),
        }
    }
}
