//! Codec registry: dispatch table from [`CodecId`] to [`Codec`]

use crate::codec::Codec;
use crate::codecs;
use crate::error::{Error, Result};
use crate::types::CodecId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Maps codec identifiers to codec implementations.
///
/// Built once before the store starts and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<CodecId, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in codec
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for codec in codecs::builtin() {
            // Built-in identifiers are distinct constants.
            let _ = registry.register(codec);
        }
        registry
    }

    /// Bind a codec under its own identifier
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> Result<()> {
        let id = codec.id();
        if self.codecs.contains_key(&id) {
            return Err(Error::DuplicateCodec(id));
        }
        self.codecs.insert(id, codec);
        Ok(())
    }

    /// Look up a codec; `None` means values tagged with `id` cannot be
    /// decoded or merged here.
    pub fn lookup(&self, id: CodecId) -> Option<Arc<dyn Codec>> {
        self.codecs.get(&id).cloned()
    }

    /// Registered identifiers in ascending order
    pub fn ids(&self) -> Vec<CodecId> {
        let mut ids: Vec<_> = self.codecs.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.ids().into_iter().map(|id| {
                let name = self.codecs[&id].name().to_string();
                (id, name)
            }))
            .finish()
    }
}
