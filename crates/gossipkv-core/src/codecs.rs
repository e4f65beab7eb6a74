//! Built-in mergeable value types and their codec identifiers

use crate::codec::{Codec, Mergeable, TypedCodec};
use crate::types::CodecId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const MAX_COUNTER: CodecId = CodecId(1);
pub const G_COUNTER: CodecId = CodecId(2);
pub const LWW_REGISTER: CodecId = CodecId(3);
pub const LWW_MAP: CodecId = CodecId(4);

/// Every built-in codec, ready for registration
pub fn builtin() -> Vec<Arc<dyn Codec>> {
    vec![
        Arc::new(TypedCodec::<MaxCounter>::new(MAX_COUNTER, "max-counter")),
        Arc::new(TypedCodec::<GCounter>::new(G_COUNTER, "g-counter")),
        Arc::new(TypedCodec::<LwwRegister>::new(LWW_REGISTER, "lww-register")),
        Arc::new(TypedCodec::<LwwMap>::new(LWW_MAP, "lww-map")),
    ]
}

// =============================================================================
// COUNTERS
// =============================================================================

/// Counter whose merge keeps the larger value
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct MaxCounter(pub u64);

impl Mergeable for MaxCounter {
    fn merge_from(&mut self, other: &Self) -> bool {
        if other.0 > self.0 {
            self.0 = other.0;
            true
        } else {
            false
        }
    }
}

/// Grow-only counter with one slot per node
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "GCounterSlots")]
pub struct GCounter {
    counts: BTreeMap<String, u64>,
}

/// Wire shape of [`GCounter`]; zero slots are dropped on decode
#[derive(Deserialize)]
struct GCounterSlots {
    counts: BTreeMap<String, u64>,
}

impl From<GCounterSlots> for GCounter {
    fn from(slots: GCounterSlots) -> Self {
        Self {
            counts: slots.counts.into_iter().filter(|(_, count)| *count > 0).collect(),
        }
    }
}

impl GCounter {
    /// Add `by` to this node's slot. Slots are only created for non-zero
    /// counts, so equal totals always encode identically.
    pub fn increment(&mut self, node: &str, by: u64) {
        if by == 0 {
            return;
        }
        *self.counts.entry(node.to_string()).or_insert(0) += by;
    }

    /// Sum over all nodes
    pub fn value(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Count contributed by one node
    pub fn node_count(&self, node: &str) -> u64 {
        self.counts.get(node).copied().unwrap_or(0)
    }
}

impl Mergeable for GCounter {
    fn merge_from(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (node, &count) in &other.counts {
            if count > self.node_count(node) {
                self.counts.insert(node.clone(), count);
                changed = true;
            }
        }
        changed
    }
}

// =============================================================================
// LAST-WRITER-WINS
// =============================================================================

/// Last-writer-wins register.
///
/// Writes are ordered by `(timestamp, node, value)`; the node name breaks
/// timestamp ties, and the value breaks ties between writes a single node made
/// with the same timestamp.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LwwRegister {
    pub timestamp: u64,
    pub node: String,
    pub value: Vec<u8>,
}

impl LwwRegister {
    pub fn new(value: impl Into<Vec<u8>>, timestamp: u64, node: impl Into<String>) -> Self {
        Self {
            timestamp,
            node: node.into(),
            value: value.into(),
        }
    }
}

impl Mergeable for LwwRegister {
    fn merge_from(&mut self, other: &Self) -> bool {
        if *other > *self {
            *self = other.clone();
            true
        } else {
            false
        }
    }
}

/// One field of an [`LwwMap`]; `value: None` is a tombstone
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LwwEntry {
    pub timestamp: u64,
    pub node: String,
    pub value: Option<Vec<u8>>,
}

/// Map of independently last-writer-wins fields.
///
/// Deletions are tombstones so that a removal gossiped out of order cannot be
/// resurrected by an older write.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LwwMap {
    entries: BTreeMap<String, LwwEntry>,
}

impl LwwMap {
    /// Write a field; ignored if an equal or newer write is already present
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Vec<u8>>, timestamp: u64, node: impl Into<String>) -> bool {
        self.apply(
            field.into(),
            LwwEntry {
                timestamp,
                node: node.into(),
                value: Some(value.into()),
            },
        )
    }

    /// Tombstone a field
    pub fn remove(&mut self, field: impl Into<String>, timestamp: u64, node: impl Into<String>) -> bool {
        self.apply(
            field.into(),
            LwwEntry {
                timestamp,
                node: node.into(),
                value: None,
            },
        )
    }

    /// Live value of a field
    pub fn get(&self, field: &str) -> Option<&[u8]> {
        self.entries.get(field).and_then(|e| e.value.as_deref())
    }

    /// Live fields in key order
    pub fn live(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value.as_deref().map(|v| (k.as_str(), v)))
    }

    pub fn tombstone_count(&self) -> usize {
        self.entries.values().filter(|e| e.value.is_none()).count()
    }

    fn apply(&mut self, field: String, entry: LwwEntry) -> bool {
        match self.entries.get(&field) {
            Some(current) if *current >= entry => false,
            _ => {
                self.entries.insert(field, entry);
                true
            }
        }
    }
}

impl Mergeable for LwwMap {
    fn merge_from(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (field, entry) in &other.entries {
            changed |= self.apply(field.clone(), entry.clone());
        }
        changed
    }
}
